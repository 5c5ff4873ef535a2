use std::sync::{Mutex, MutexGuard};

/// Size of the process-wide staging buffer used by unaligned section IO.
pub(crate) const STAGING_BUFFER_SIZE: usize = 0x800000;

static STAGING_BUFFER: Mutex<Option<Vec<u8>>> = Mutex::new(None);

/// Exclusive access to the staging buffer. Entry points acquire this once and
/// thread it through their internals, so the buffer is held for the whole
/// call.
pub(crate) struct StagingGuard(MutexGuard<'static, Option<Vec<u8>>>);

pub(crate) fn acquire() -> StagingGuard {
    StagingGuard(STAGING_BUFFER.lock().unwrap())
}

impl StagingGuard {
    /// The buffer is allocated on first use.
    pub fn buffer(&mut self) -> &mut [u8] {
        self.0
            .get_or_insert_with(|| vec![0; STAGING_BUFFER_SIZE])
            .as_mut_slice()
    }
}

/// Frees the shared staging buffer at engine teardown. The next section
/// operation allocates a fresh one.
pub fn release_staging_buffer() {
    *STAGING_BUFFER.lock().unwrap() = None;
}
