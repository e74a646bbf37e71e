use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use super::model::KokoroError;

/// Width of one style vector.
pub const STYLE_DIM: usize = 256;

/// Style vectors per voice, indexed by phoneme count.
pub struct VoiceStore {
    voices: HashMap<String, Vec<[f32; STYLE_DIM]>>,
}

impl VoiceStore {
    /// Read every `<voice>.npy` member of a numpy `.npz` archive.
    pub fn load(path: &Path) -> Result<Self, KokoroError> {
        let bad = |e: zip::result::ZipError| KokoroError::VoiceArchive(e.to_string());
        let mut archive = zip::ZipArchive::new(std::fs::File::open(path)?).map_err(bad)?;

        let mut voices = HashMap::new();
        for i in 0..archive.len() {
            let mut member = archive.by_index(i).map_err(bad)?;
            if member.is_dir() {
                continue;
            }
            let Some(name) = member.name().strip_suffix(".npy").map(str::to_string) else {
                continue;
            };
            let mut bytes = Vec::with_capacity(member.size() as usize);
            member.read_to_end(&mut bytes)?;
            voices.insert(name.clone(), styles_from_npy(&bytes).map_err(|reason| {
                KokoroError::VoiceArchive(format!("{name}: {reason}"))
            })?);
        }

        log::info!("Loaded {} Kokoro voices", voices.len());
        Ok(Self { voices })
    }

    /// Style row `index` of `voice`, clamped to the last row.
    pub fn style(&self, voice: &str, index: usize) -> Result<[f32; STYLE_DIM], KokoroError> {
        let rows = self
            .voices
            .get(voice)
            .filter(|rows| !rows.is_empty())
            .ok_or_else(|| KokoroError::UnknownVoice(voice.to_string()))?;
        Ok(rows[index.min(rows.len() - 1)])
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.voices.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Decode a little-endian float32 `.npy` payload into style rows.
fn styles_from_npy(bytes: &[u8]) -> Result<Vec<[f32; STYLE_DIM]>, String> {
    let rest = bytes
        .strip_prefix(b"\x93NUMPY")
        .ok_or("not a .npy file")?;
    let (major, rest) = rest.split_first().ok_or("truncated header")?;
    let rest = rest.get(1..).ok_or("truncated header")?;

    // Version 1 stores the header length in two bytes, later versions in four.
    let (header_len, rest) = if *major == 1 {
        let (len, rest) = rest.split_at_checked(2).ok_or("truncated header")?;
        (u16::from_le_bytes([len[0], len[1]]) as usize, rest)
    } else {
        let (len, rest) = rest.split_at_checked(4).ok_or("truncated header")?;
        (u32::from_le_bytes([len[0], len[1], len[2], len[3]]) as usize, rest)
    };
    let (header, data) = rest.split_at_checked(header_len).ok_or("truncated header")?;

    let header = String::from_utf8_lossy(header);
    if !header.contains("'<f4'") {
        return Err(format!("expected little-endian float32, header is {}", header.trim()));
    }
    if data.len() % (4 * STYLE_DIM) != 0 {
        return Err(format!("{} data bytes is not a whole number of style rows", data.len()));
    }

    Ok(data
        .chunks_exact(4 * STYLE_DIM)
        .map(|row| {
            let mut style = [0f32; STYLE_DIM];
            for (dst, src) in style.iter_mut().zip(row.chunks_exact(4)) {
                *dst = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
            }
            style
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn npy(rows: usize) -> Vec<u8> {
        let mut header = format!(
            "{{'descr': '<f4', 'fortran_order': False, 'shape': ({rows}, 1, {STYLE_DIM}), }}"
        );
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');

        let mut out = b"\x93NUMPY\x01\x00".to_vec();
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        for r in 0..rows {
            for _ in 0..STYLE_DIM {
                out.extend_from_slice(&(r as f32).to_le_bytes());
            }
        }
        out
    }

    #[test]
    fn parses_rows_in_order() {
        let styles = styles_from_npy(&npy(3)).unwrap();
        assert_eq!(styles.len(), 3);
        assert_eq!(styles[2][STYLE_DIM - 1], 2.0);
    }

    #[test]
    fn rejects_non_float_payloads() {
        let mut bytes = npy(1);
        let at = bytes.windows(3).position(|w| w == b"<f4").unwrap();
        bytes[at + 1] = b'i';
        assert!(styles_from_npy(&bytes).unwrap_err().contains("float32"));
        assert!(styles_from_npy(b"\x93NUMP").is_err());
    }

    #[test]
    fn loads_archive_and_clamps_style_index() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voices.bin");
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        zip.start_file("zf_xiaobei.npy", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(&npy(4)).unwrap();
        zip.finish().unwrap();

        let store = VoiceStore::load(&path).unwrap();
        assert_eq!(store.names(), vec!["zf_xiaobei"]);
        assert_eq!(store.style("zf_xiaobei", 99).unwrap()[0], 3.0);
        assert!(matches!(
            store.style("af_heart", 0),
            Err(KokoroError::UnknownVoice(_))
        ));
    }
}
