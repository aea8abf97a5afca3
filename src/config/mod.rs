pub mod paths;
pub mod persistence;
pub mod schema;

pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_buffer_depth() -> usize {
    1024
}

fn default_flush_batch_size() -> usize {
    64
}

fn default_flush_max_retries() -> u32 {
    3
}

fn default_flush_retry_delay_ms() -> u64 {
    50
}

fn default_journal_max_deltas() -> usize {
    100_000
}
