/// Counter for micro-batches run to completion, labelled by outcome
pub const BATCHES_COMPLETED_COUNTER: &str = "click_ingest_batches_completed_total";

/// Counter for rows appended to the table
pub const ROWS_WRITTEN_COUNTER: &str = "click_ingest_rows_written_total";

/// Counter for partitions resumed from the earliest offset after losing data
pub const DATA_LOSS_COUNTER: &str = "click_ingest_data_loss_total";

/// Histogram for fetch-decode-append-commit duration of one batch
pub const BATCH_DURATION_HISTOGRAM: &str = "click_ingest_batch_duration_seconds";

/// Counter for Delta commit attempts that lost a version race
pub const COMMIT_CONFLICTS_COUNTER: &str = "click_ingest_commit_conflicts_total";
