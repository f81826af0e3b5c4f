mod paginated_offset;
mod paginated_shared;

pub use paginated_offset::*;
pub use paginated_shared::*;
