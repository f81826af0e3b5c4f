use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::atomic::AtomicU64,
    time::Duration,
};

macro_rules! defined_id_gen {
    ($name:ident) => {
        pub(crate) fn $name() -> u64 {
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
        }
    };
}

defined_id_gen!(new_cache_id);
defined_id_gen!(new_generation_id);
defined_id_gen!(new_fetch_id);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct KeyHash(u64);

impl KeyHash {
    pub fn new<K: Hash>(key: &K) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        Self(hasher.finish())
    }
}

impl Hash for KeyHash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Add a std duration to a chrono datetime, saturating instead of overflowing,
/// so `Duration::MAX` can be used to mean "never".
pub(crate) fn safe_dt_dur_add(
    dt: chrono::DateTime<chrono::Utc>,
    dur: Duration,
) -> chrono::DateTime<chrono::Utc> {
    chrono::TimeDelta::from_std(dur)
        .ok()
        .and_then(|delta| dt.checked_add_signed(delta))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}
