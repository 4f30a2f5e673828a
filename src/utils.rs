use anyhow::Result;
use std::path::{Path, PathBuf};
use url::Url;

/// Suffix of the file a job assembles into before it is renamed into place.
pub const ASSEMBLING_SUFFIX: &str = "assembling";

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return Ok(filename.to_string());
            }
        }
    }

    // Fallback if no filename found in path
    Ok(format!("download_{}", new_job_id()))
}

/// Makes a title safe to use as a file name on every platform.
///
/// Drops `\ / : * ? " < > |`, control characters and emoji, then trims
/// surrounding whitespace and trailing dots.
pub fn sanitize_filename(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control() && !is_emoji(*c))
        .collect();

    let cleaned = cleaned.trim().trim_end_matches('.').trim_end();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF   // pictographs, emoticons, transport, flags
        | 0x2600..=0x27BF   // misc symbols and dingbats
        | 0x2B00..=0x2BFF   // arrows and stars
        | 0xFE00..=0xFE0F   // variation selectors
        | 0x200D            // zero width joiner
        | 0xE0020..=0xE007F // tag sequences
    )
}

/// Final file name for a title and optional extension.
pub fn output_file_name(title: &str, extension: Option<&str>) -> String {
    let name = sanitize_filename(title);
    match extension.map(|e| e.trim_start_matches('.')).filter(|e| !e.is_empty()) {
        Some(ext) if !name.to_lowercase().ends_with(&format!(".{}", ext.to_lowercase())) => {
            format!("{}.{}", name, ext)
        }
        _ => name,
    }
}

/// Length of the id [`new_job_id`] produces.
pub const JOB_ID_LEN: usize = 12;

/// Short identifier keeping temporary files of concurrent jobs apart.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..JOB_ID_LEN].to_string()
}

fn is_job_id(s: &str) -> bool {
    s.len() == JOB_ID_LEN && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// `<dir>/<file_name>.<job_id>`, the stem every part file of a job shares.
pub fn part_prefix(dir: &Path, file_name: &str, job_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", file_name, job_id))
}

/// `<prefix>.part<index>`
pub fn part_path(prefix: &Path, index: usize) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!(".part{}", index));
    PathBuf::from(name)
}

pub fn assembling_path(dir: &Path, file_name: &str, job_id: &str) -> PathBuf {
    dir.join(format!("{}.{}.{}", file_name, job_id, ASSEMBLING_SUFFIX))
}

/// Whether `file_name` is a part or staging file of some job, i.e.
/// `<name>.<job_id>.part<N>` or `<name>.<job_id>.assembling`.
pub fn is_temporary_file(file_name: &str) -> bool {
    let Some((stem, suffix)) = file_name.rsplit_once('.') else {
        return false;
    };
    let temporary_suffix = suffix == ASSEMBLING_SUFFIX
        || suffix
            .strip_prefix("part")
            .map_or(false, |index| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()));
    if !temporary_suffix {
        return false;
    }

    match stem.rsplit_once('.') {
        Some((name, job_id)) => !name.is_empty() && is_job_id(job_id),
        None => false,
    }
}

/// Glob patterns, relative to a directory, matching what [`is_temporary_file`] accepts.
pub fn temporary_file_globs() -> [String; 2] {
    let job_id = "[0-9a-f]".repeat(JOB_ID_LEN);
    [
        format!("*.{}.part[0-9]*", job_id),
        format!("*.{}.{}", job_id, ASSEMBLING_SUFFIX),
    ]
}
