use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use super::model::KokoroError;

/// How to invoke espeak-ng.
#[derive(Debug, Clone)]
pub struct Espeak {
    pub binary: PathBuf,
    /// Passed as `--path` when set.
    pub data_dir: Option<PathBuf>,
}

impl Default for Espeak {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("espeak-ng"),
            data_dir: None,
        }
    }
}

impl Espeak {
    fn run(&self, input: &str, language: &str) -> Result<String, KokoroError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-q", "--ipa", "--stdin", "-v", language]);
        if let Some(dir) = &self.data_dir {
            cmd.arg("--path").arg(dir);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => KokoroError::EspeakNotFound,
                _ => KokoroError::Io(e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // The last line is dropped without a terminator.
            stdin.write_all(format!("{input}\n").as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(KokoroError::Phonemizer(format!(
                "espeak-ng exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// IPA for each input line, one output line per input line.
    fn ipa(&self, lines: &[&str], language: &str) -> Result<Vec<String>, KokoroError> {
        let stdout = self.run(&lines.join("\n"), language)?;
        let produced: Vec<String> = stdout.lines().map(|l| l.trim().to_string()).collect();
        if produced.len() == lines.len() {
            return Ok(produced);
        }
        log::debug!(
            "espeak-ng returned {} lines for {}, retrying per line",
            produced.len(),
            lines.len()
        );
        lines
            .iter()
            .map(|line| {
                let out = self.run(line, language)?;
                Ok(out.split_whitespace().collect::<Vec<_>>().join(" "))
            })
            .collect()
    }
}

/// espeak-ng voice for a language code, falling back to the Kokoro voice
/// prefix (`zf_`, `af_`, ...) when the code is unknown.
pub fn espeak_language(language: &str, voice: &str) -> &'static str {
    match language.to_ascii_lowercase().as_str() {
        "zh" | "zh-cn" | "cmn" | "zh-hans" => return "cmn",
        "en" | "en-us" => return "en-us",
        "en-gb" => return "en-gb",
        "ja" => return "ja",
        "es" => return "es",
        "fr" => return "fr",
        _ => {}
    }
    match voice.get(..1) {
        Some("a") => "en-us",
        Some("b") => "en-gb",
        Some("j") => "ja",
        Some("e") => "es",
        Some("f") => "fr",
        _ => "cmn",
    }
}

#[derive(Debug, PartialEq)]
enum Piece {
    Words(String),
    Mark(char),
}

/// Split into word runs and punctuation marks. Full-width CJK punctuation is
/// folded to its ASCII counterpart, which is what the vocabulary contains.
fn pieces(text: &str) -> Vec<Piece> {
    let mut out = Vec::new();
    let mut words = String::new();
    let flush = |words: &mut String, out: &mut Vec<Piece>| {
        let trimmed = words.split_whitespace().collect::<Vec<_>>().join(" ");
        if !trimmed.is_empty() {
            out.push(Piece::Words(trimmed));
        }
        words.clear();
    };

    for ch in text.chars() {
        let mark = match ch {
            '，' | '、' => Some(','),
            '。' => Some('.'),
            '！' => Some('!'),
            '？' => Some('?'),
            '；' => Some(';'),
            '：' => Some(':'),
            '.' | ',' | '!' | '?' | ';' | ':' => Some(ch),
            _ => None,
        };
        match mark {
            Some(m) => {
                flush(&mut words, &mut out);
                out.push(Piece::Mark(m));
            }
            None => words.push(ch),
        }
    }
    flush(&mut words, &mut out);
    out
}

/// Token ids for `text`: espeak-ng IPA for word runs, punctuation mapped
/// directly. Characters outside the vocabulary are dropped.
pub fn phonemize(
    text: &str,
    language: &str,
    vocab: &HashMap<char, i64>,
    espeak: &Espeak,
) -> Result<Vec<i64>, KokoroError> {
    let pieces = pieces(text);
    let runs: Vec<&str> = pieces
        .iter()
        .filter_map(|p| match p {
            Piece::Words(w) => Some(w.as_str()),
            Piece::Mark(_) => None,
        })
        .collect();
    let ipa = if runs.is_empty() {
        Vec::new()
    } else {
        espeak.ipa(&runs, language)?
    };

    let mut ipa = ipa.into_iter();
    let mut ids = Vec::new();
    for piece in &pieces {
        match piece {
            Piece::Words(_) => {
                let line = ipa.next().unwrap_or_default();
                ids.extend(line.chars().filter(|&c| c != '_').filter_map(|c| vocab.get(&c)));
            }
            Piece::Mark(m) => ids.extend(vocab.get(m)),
        }
    }
    Ok(ids)
}
