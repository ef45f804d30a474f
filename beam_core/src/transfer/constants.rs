use std::time::Duration;

/// Body chunk size for streaming (64 KiB)
pub const CHUNK_SIZE: usize = 64 * 1024;

/// A control line longer than this is rejected as malformed
pub const MAX_HEADER_LEN: usize = 8 * 1024;

/// Maximum file name length after sanitising
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Hidden folder inside the download dir that holds partial files
pub const STAGING_DIR: &str = ".beam-partial";

/// Throughput samples kept for smoothing
pub const SPEED_WINDOW: usize = 10;

/// Minimum spacing between throughput samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// How long a sender waits for the receiver to close after a half-close
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);
