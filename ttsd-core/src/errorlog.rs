//! Fatal-synthesis-failure diagnostic log. Parameter/state errors are
//! never written here — only engine failures delivered asynchronously via
//! the error callback are persisted.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::voice::VoiceType;

/// One diagnostic record: function, line, message, uid, utt_id, language,
/// voice_type, text, and engine id.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub function: String,
    pub line: u32,
    pub message: String,
    pub uid: u32,
    pub utt_id: u32,
    pub language: String,
    pub voice_type: VoiceType,
    pub text: String,
    pub engine_id: String,
}

impl ErrorRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        function: &'static str,
        line: u32,
        message: impl Into<String>,
        uid: u32,
        utt_id: u32,
        language: impl Into<String>,
        voice_type: VoiceType,
        text: impl Into<String>,
        engine_id: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            function: function.to_string(),
            line,
            message: message.into(),
            uid,
            utt_id,
            language: language.into(),
            voice_type,
            text: text.into(),
            engine_id: engine_id.into(),
        }
    }
}

/// Appends one JSON-lines record to the error log file, creating it (and
/// its parent directory) if necessary.
pub fn append_error_record(path: &Path, record: &ErrorRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record).map_err(|e| anyhow::anyhow!(e))?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Default error-log filename, matching `ttsd_config.c`'s
/// `DEFAULT_ERROR_FILE_NAME` naming convention.
pub fn default_error_log_path(config_dir: &Path) -> std::path::PathBuf {
    config_dir.join("ttsd_default.err")
}

/// Macro capturing the call site's function name and line, matching the
/// original's per-call-site `function, line` diagnostic fields without
/// requiring every caller to spell them out.
#[macro_export]
macro_rules! error_record {
    ($message:expr, $uid:expr, $utt_id:expr, $language:expr, $voice_type:expr, $text:expr, $engine_id:expr) => {
        $crate::errorlog::ErrorRecord::new(
            concat!(module_path!(), "::", "synthesis"),
            line!(),
            $message,
            $uid,
            $utt_id,
            $language,
            $voice_type,
            $text,
            $engine_id,
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempdir().unwrap();
        let path = default_error_log_path(dir.path());
        let record = ErrorRecord::new(
            "test_fn",
            42,
            "synthesis failed",
            1,
            5,
            "en_US",
            VoiceType::Female,
            "hello",
            "default",
        );
        append_error_record(&path, &record).unwrap();
        append_error_record(&path, &record).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"uid\":1"));
        assert!(contents.contains("synthesis failed"));
    }
}
