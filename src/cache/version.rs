//! Cache generation naming.

use sha2::{Digest, Sha256};

use super::manifest::AssetManifest;

/// Hex characters of the manifest digest kept in a derived token.
const DERIVED_TOKEN_LEN: usize = 16;

/// Identifier of the current cache generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVersion(String);

impl CacheVersion {
  /// Build token followed by the salt. Without a build token the manifest
  /// content stands in for it, so an unchanged asset set keeps its generation.
  pub fn resolve(build: Option<&str>, salt: &str, manifest: &AssetManifest) -> Self {
    let build = match build.map(str::trim).filter(|b| !b.is_empty()) {
      Some(b) => b.to_string(),
      None => Self::manifest_token(manifest),
    };

    Self(format!("{}{}", build, salt))
  }

  fn manifest_token(manifest: &AssetManifest) -> String {
    let mut hasher = Sha256::new();
    for url in manifest.urls() {
      hasher.update(url.as_str().as_bytes());
      hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    format!("v-{}", &digest[..DERIVED_TOKEN_LEN])
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for CacheVersion {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn manifest(entries: &[&str]) -> AssetManifest {
    let origin = Url::parse("https://food.example/").unwrap();
    AssetManifest::resolve(&origin, entries).unwrap()
  }

  #[test]
  fn test_build_and_salt_concatenate() {
    let m = manifest(&["/"]);
    assert_eq!(CacheVersion::resolve(Some("v20230312"), "-3", &m).as_str(), "v20230312-3");
    assert_eq!(CacheVersion::resolve(Some("v20230312"), "", &m).as_str(), "v20230312");
  }

  #[test]
  fn test_derived_token_is_deterministic() {
    let a = CacheVersion::resolve(None, "", &manifest(&["/", "/main.js"]));
    let b = CacheVersion::resolve(Some("  "), "", &manifest(&["/", "/main.js"]));
    assert_eq!(a, b);
    assert!(a.as_str().starts_with("v-"));
    assert_eq!(a.as_str().len(), 2 + DERIVED_TOKEN_LEN);
  }

  #[test]
  fn test_derived_token_tracks_manifest_and_salt() {
    let base = CacheVersion::resolve(None, "", &manifest(&["/", "/main.js"]));
    let changed = CacheVersion::resolve(None, "", &manifest(&["/", "/main.js", "/c.css"]));
    let salted = CacheVersion::resolve(None, "-bust", &manifest(&["/", "/main.js"]));

    assert_ne!(base, changed);
    assert_eq!(salted.as_str(), format!("{}-bust", base));
  }
}
