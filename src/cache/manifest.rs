//! Asset manifest: the URLs that must be present in a freshly installed
//! generation.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashSet;
use std::path::Path;
use url::Url;

/// Ordered, de-duplicated list of absolute asset URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
  urls: Vec<Url>,
}

impl AssetManifest {
  /// Resolve manifest entries against the origin. Relative paths such as
  /// `/index.html` or `data/food.json` become absolute; duplicates are
  /// dropped, keeping the first occurrence.
  pub fn resolve<I, S>(origin: &Url, entries: I) -> Result<Self>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();

    for entry in entries {
      let entry = entry.as_ref().trim();
      if entry.is_empty() {
        continue;
      }
      let url = origin
        .join(entry)
        .map_err(|e| eyre!("Invalid manifest entry '{}': {}", entry, e))?;
      if seen.insert(url.as_str().to_string()) {
        urls.push(url);
      }
    }

    Ok(Self { urls })
  }

  /// Read entries from a build-tool manifest file.
  ///
  /// Accepts either a JSON array of strings or one entry per line
  /// (blank lines and `#` comments ignored).
  pub fn read_entries(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read manifest file {}: {}", path.display(), e))?;

    if contents.trim_start().starts_with('[') {
      return serde_json::from_str(&contents)
        .map_err(|e| eyre!("Failed to parse manifest file {}: {}", path.display(), e));
    }

    Ok(
      contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect(),
    )
  }

  pub fn urls(&self) -> &[Url] {
    &self.urls
  }

  pub fn len(&self) -> usize {
    self.urls.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn origin() -> Url {
    Url::parse("https://food.example/app/").unwrap()
  }

  #[test]
  fn test_resolve_relative_and_absolute() {
    let manifest = AssetManifest::resolve(
      &origin(),
      ["/", "index.html", "/data/food.json", "https://cdn.example/font.woff2"],
    )
    .unwrap();

    let urls: Vec<&str> = manifest.urls().iter().map(Url::as_str).collect();
    assert_eq!(
      urls,
      vec![
        "https://food.example/",
        "https://food.example/app/index.html",
        "https://food.example/data/food.json",
        "https://cdn.example/font.woff2",
      ]
    );
  }

  #[test]
  fn test_resolve_drops_duplicates_and_blanks() {
    let manifest =
      AssetManifest::resolve(&origin(), ["/a.js", "", "/b.css", "/a.js", "  "]).unwrap();
    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest.urls()[0].path(), "/a.js");
    assert_eq!(manifest.urls()[1].path(), "/b.css");
  }

  #[test]
  fn test_read_json_manifest() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"["/index.html", "/main.js"]"#).unwrap();

    let entries = AssetManifest::read_entries(file.path()).unwrap();
    assert_eq!(entries, vec!["/index.html", "/main.js"]);
  }

  #[test]
  fn test_read_line_manifest() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# generated").unwrap();
    writeln!(file, "/index.html").unwrap();
    writeln!(file).unwrap();
    writeln!(file, "  /style.css  ").unwrap();

    let entries = AssetManifest::read_entries(file.path()).unwrap();
    assert_eq!(entries, vec!["/index.html", "/style.css"]);
  }
}
