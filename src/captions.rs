//! Caption cue generation.
//!
//! Word timestamps are distributed evenly across the narration duration and
//! grouped into short uppercase phrases sized for mobile viewing.

/// One caption phrase with its display window.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptionCue {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Build caption cues for a narration of known duration.
pub fn caption_cues(
    narration: &str,
    audio_duration: f64,
    words_per_cue: usize,
    max_cues: usize,
) -> Vec<CaptionCue> {
    let words = word_timestamps(narration, audio_duration);
    if words.is_empty() || words_per_cue == 0 {
        return Vec::new();
    }

    let mut cues = Vec::new();
    for chunk in words.chunks(words_per_cue) {
        let text = chunk
            .iter()
            .map(|w| w.word.to_uppercase())
            .collect::<Vec<_>>()
            .join(" ");
        cues.push(CaptionCue {
            text,
            start: chunk[0].start,
            end: chunk[chunk.len() - 1].end,
        });
        if cues.len() >= max_cues {
            break;
        }
    }
    cues
}

struct TimedWord {
    word: String,
    start: f64,
    end: f64,
}

/// Assign each word an equal slice of the audio duration.
fn word_timestamps(text: &str, total_duration: f64) -> Vec<TimedWord> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, ',' | '.' | '!' | '?' | '"' | '\''))
        .collect();
    let words: Vec<&str> = cleaned.split_whitespace().collect();
    if words.is_empty() || total_duration <= 0.0 {
        return Vec::new();
    }

    let per_word = total_duration / words.len() as f64;
    words
        .iter()
        .enumerate()
        .map(|(i, word)| TimedWord {
            word: word.to_string(),
            start: i as f64 * per_word,
            end: (i + 1) as f64 * per_word,
        })
        .collect()
}

/// Escape text for use inside an ffmpeg drawtext filter argument.
pub fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace(':', "\\:")
        .replace(',', "\\,")
        .replace('%', "\\%")
}
