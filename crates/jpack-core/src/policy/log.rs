/// Severity-leveled sink the checker reports its own diagnostics through.
pub trait PolicyLog: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards checker diagnostics to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl PolicyLog for TracingLog {
    fn debug(&self, message: &str) {
        tracing::debug!(target: "jpack::policy", "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "jpack::policy", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "jpack::policy", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "jpack::policy", "{message}");
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::sync::Mutex;

    use super::PolicyLog;

    /// Captures diagnostics as `level: message` lines.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingLog {
        pub(crate) lines: Mutex<Vec<String>>,
    }

    impl RecordingLog {
        fn push(&self, level: &str, message: &str) {
            self.lines.lock().unwrap().push(format!("{level}: {message}"));
        }

        pub(crate) fn at(&self, level: &str) -> Vec<String> {
            let prefix = format!("{level}: ");
            self.lines
                .lock()
                .unwrap()
                .iter()
                .filter_map(|line| line.strip_prefix(&prefix).map(str::to_string))
                .collect()
        }
    }

    impl PolicyLog for RecordingLog {
        fn debug(&self, message: &str) {
            self.push("debug", message);
        }
        fn info(&self, message: &str) {
            self.push("info", message);
        }
        fn warn(&self, message: &str) {
            self.push("warn", message);
        }
        fn error(&self, message: &str) {
            self.push("error", message);
        }
    }
}
