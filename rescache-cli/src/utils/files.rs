use std::path::Path;

use url::Url;

use crate::error::AppError;

/// Source id for resources fetched over HTTP(S)
pub const HTTP_SOURCE: &str = "http";
/// Source id for resources read from the local file root
pub const FILE_SOURCE: &str = "file";

/// A fetch target as typed on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub source_id: &'static str,
    pub resource_id: String,
}

/// Classify an input as an HTTP(S) URL or a path under the file root.
pub fn parse_target(input: &str) -> Result<Target, AppError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AppError::InvalidInput("empty input".to_string()));
    }
    if input.starts_with("http://") || input.starts_with("https://") {
        let url = Url::parse(input).map_err(|e| AppError::InvalidInput(format!("{input}: {e}")))?;
        return Ok(Target {
            source_id: HTTP_SOURCE,
            resource_id: url.to_string(),
        });
    }
    let resource_id = input.strip_prefix("file://").unwrap_or(input);
    Ok(Target {
        source_id: FILE_SOURCE,
        resource_id: resource_id.trim_start_matches("./").to_string(),
    })
}

/// Pick a file name for a fetched resource, falling back to the last
/// segment of its id.
pub fn output_file_name(resource_name: Option<&str>, resource_id: &str) -> String {
    let candidate = resource_name
        .filter(|n| !n.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let trimmed = resource_id
                .split(['?', '#'])
                .next()
                .unwrap_or(resource_id)
                .trim_end_matches('/');
            trimmed
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("resource")
                .to_string()
        });
    sanitize_file_name(&candidate)
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ' ');
    // we dont want large filenames
    let cleaned: String = cleaned.chars().take(120).collect();
    if cleaned.is_empty() {
        "resource".to_string()
    } else {
        cleaned
    }
}

#[inline]
pub async fn create_dirs(path: &Path) -> Result<(), AppError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(AppError::Io)?;
    Ok(())
}
