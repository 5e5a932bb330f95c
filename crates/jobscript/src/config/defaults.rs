//! Default values for application configuration fields

use std::time::Duration;

pub fn default_script_root() -> String {
    "./jobs".to_string()
}

pub fn default_scripts_table() -> String {
    "job_scripts".to_string()
}

pub fn default_shell() -> String {
    "/bin/sh".to_string()
}

pub fn default_shell_args() -> Vec<String> {
    vec!["-c".to_string()]
}

pub fn default_fetch_timeout() -> Duration {
    Duration::from_secs(30)
}

pub fn default_sql_boundary() -> String {
    "--job".to_string()
}

pub fn default_sync_expression() -> String {
    "*/5 * * * *".to_string()
}

pub fn default_payload_size_limit() -> usize {
    // JSON-encoded parameter payloads larger than this fail the quota check.
    1024 * 1024
}

pub fn default_envelope_max_bytes() -> usize {
    64 * 1024
}

pub fn default_result_max_bytes() -> usize {
    32 * 1024
}

pub fn default_true() -> bool {
    true
}
