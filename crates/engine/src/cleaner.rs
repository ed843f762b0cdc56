//! Post-processing of raw generated text

use batchloop_common::CleanerConfig;

/// Strips chat-template markers and conversational turn markers from responses
#[derive(Debug, Clone)]
pub struct ResponseCleaner {
    markers: Vec<String>,
    stop_sequences: Vec<String>,
}

impl ResponseCleaner {
    pub fn new(config: &CleanerConfig, stop_sequences: &[String]) -> Self {
        Self {
            markers: config.markers.iter().filter(|m| !m.is_empty()).cloned().collect(),
            stop_sequences: stop_sequences.iter().filter(|s| !s.is_empty()).cloned().collect(),
        }
    }

    /// Clean one response
    ///
    /// Markers are removed until none remain, the text is cut at the first
    /// stop sequence, then leading junk and trailing whitespace are trimmed.
    pub fn clean(&self, raw: &str) -> String {
        let mut text = raw.to_string();

        loop {
            let before = text.len();
            for marker in &self.markers {
                if text.contains(marker.as_str()) {
                    text = text.replace(marker.as_str(), "");
                }
            }
            if text.len() == before {
                break;
            }
        }

        if let Some(cut) = self
            .stop_sequences
            .iter()
            .filter_map(|s| text.find(s.as_str()))
            .min()
        {
            text.truncate(cut);
        }

        text.trim_start_matches(is_leading_junk)
            .trim_end()
            .to_string()
    }

    /// Lossy UTF-8 decode followed by `clean`
    pub fn clean_bytes(&self, raw: &[u8]) -> String {
        self.clean(&String::from_utf8_lossy(raw))
    }
}

impl Default for ResponseCleaner {
    fn default() -> Self {
        Self::new(
            &CleanerConfig::default(),
            &batchloop_common::GenerationParams::default().stop_sequences,
        )
    }
}

fn is_leading_junk(c: char) -> bool {
    c == '?' || c == char::REPLACEMENT_CHARACTER || c.is_control() || c.is_whitespace()
}
