use std::time::Duration;

use rand::Rng;

pub const MEDIA_EXTENSION: &str = "mp3";

/// Marker object checked before re-downloading a whole archive. Every archive
/// the upstream serves carries this member, so its presence under a folder's
/// key prefix means a previous run finished uploading that folder.
pub const SESSION_MARKER: &str = "ORIGINAL.mp3";

pub fn jitter(duration: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let rndm = rng.gen_range(0.5..1.5);
    duration.mul_f64(rndm)
}

/// Strips characters that would change the meaning of a path component.
pub fn sanitize_component(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            c => c,
        })
        .collect()
}

/// Derives a collision-resistant destination folder name from the archive
/// filename plus the date/time label found next to the download link.
pub fn derive_folder_name(filename: &str, date_text: &str, time_text: &str) -> String {
    let stem = filename.split('.').next().unwrap_or(filename);
    format!(
        "{}_{}_{}",
        sanitize_component(stem),
        sanitize_component(date_text),
        sanitize_component(time_text)
    )
}

/// Joins the fixed store prefix with a folder-relative path, always with
/// forward slashes.
pub fn object_key(prefix: &str, relative: &str) -> String {
    format!("{}/{}", prefix, relative.replace('\\', "/"))
}
