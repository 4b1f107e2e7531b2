pub const MESSAGES_RECEIVED: &str = "tally_messages_received_total";
pub const FETCH_ERRORS: &str = "tally_fetch_errors_total";
pub const DECODE_ERRORS: &str = "tally_decode_errors_total";
pub const BATCHES_FLUSHED: &str = "tally_batches_flushed_total";
pub const BATCH_SIZE: &str = "tally_batch_size";
pub const FLUSH_DURATION: &str = "tally_flush_duration_seconds";
pub const SINK_ERRORS: &str = "tally_sink_errors_total";
pub const COMMITS: &str = "tally_commits_total";
pub const COMMIT_ERRORS: &str = "tally_commit_errors_total";
pub const COMMITS_DEFERRED: &str = "tally_commits_deferred_total";
pub const REJECT_ERRORS: &str = "tally_reject_errors_total";
pub const QUEUE_BLOCKED: &str = "tally_queue_blocked_total";
pub const UNITS_DROPPED_ON_SHUTDOWN: &str = "tally_units_dropped_on_shutdown_total";
