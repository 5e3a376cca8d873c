use super::SubmitError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{fs, path::Path};
use tracing::debug;

// the shared descriptor line that selects which per-user jar directory the
// cluster images copy their artifacts from
static JAR_COPY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\ACOPY \./jars/(?:[a-zA-Z0-9_-]+/\*|\*) /opt/jars\z").unwrap());

fn jar_copy_line(user_id: &str) -> String {
    format!("COPY ./jars/{user_id}/* /opt/jars")
}

/// Rewrite the build descriptor so its jar copy line references `user_id`'s
/// artifact directory. Every other line passes through byte-identical,
/// including its line ending. Returns whether any line was rewritten.
///
/// The descriptor is shared cluster-wide and mutated in place, callers must
/// hold the cluster permit for the whole submission.
pub fn retarget_jar_directory(descriptor: &Path, user_id: &str) -> Result<bool, SubmitError> {
    let content = fs::read_to_string(descriptor).map_err(SubmitError::DescriptorIo)?;
    let replacement = jar_copy_line(user_id);

    let mut rewritten = String::with_capacity(content.len());
    let mut matched = false;

    for segment in content.split_inclusive('\n') {
        let body = segment.trim_end_matches('\n').trim_end_matches('\r');
        let ending = &segment[body.len()..];

        if JAR_COPY_LINE.is_match(body) {
            matched = true;
            rewritten.push_str(&replacement);
            rewritten.push_str(ending);
        } else {
            rewritten.push_str(segment);
        }
    }

    if matched {
        fs::write(descriptor, rewritten).map_err(SubmitError::DescriptorIo)?;
        debug!(user = %user_id, "Retargeted build descriptor jar directory");
    }

    Ok(matched)
}
