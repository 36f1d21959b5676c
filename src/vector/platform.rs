//! Release asset resolution for the current platform.

use crate::error::{LifecycleError, LifecycleResult};

const RELEASE_BASE: &str = "https://github.com/qdrant/qdrant/releases/download";

/// A downloadable Qdrant build for one OS/arch pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
    pub asset: &'static str,
}

const PLATFORMS: &[Platform] = &[
    Platform {
        os: "windows",
        arch: "x86_64",
        asset: "qdrant-x86_64-pc-windows-msvc.zip",
    },
    Platform {
        os: "macos",
        arch: "x86_64",
        asset: "qdrant-x86_64-apple-darwin.zip",
    },
    Platform {
        os: "macos",
        arch: "aarch64",
        asset: "qdrant-aarch64-apple-darwin.zip",
    },
    Platform {
        os: "linux",
        arch: "x86_64",
        asset: "qdrant-x86_64-unknown-linux-musl.tar.gz",
    },
    Platform {
        os: "linux",
        arch: "aarch64",
        asset: "qdrant-aarch64-unknown-linux-musl.tar.gz",
    },
];

impl Platform {
    pub fn resolve(os: &str, arch: &str) -> LifecycleResult<Platform> {
        PLATFORMS
            .iter()
            .find(|p| p.os == os && p.arch == arch)
            .cloned()
            .ok_or_else(|| LifecycleError::UnsupportedPlatform {
                os: os.to_string(),
                arch: arch.to_string(),
            })
    }

    pub fn current() -> LifecycleResult<Platform> {
        Self::resolve(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn download_url(&self, version: &str) -> String {
        format!("{}/{}/{}", RELEASE_BASE, version, self.asset)
    }

    pub fn checksum_url(&self, version: &str) -> String {
        format!("{}.sha256", self.download_url(version))
    }

    /// File name of the server executable inside the archive.
    pub fn binary_name(&self) -> &'static str {
        if self.os == "windows" {
            "qdrant.exe"
        } else {
            "qdrant"
        }
    }
}

/// First whitespace-separated field of a `.sha256` file.
pub fn parse_checksum(body: &str) -> Option<String> {
    body.split_whitespace()
        .next()
        .filter(|s| s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()))
        .map(|s| s.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_linux_x86() {
        let p = Platform::resolve("linux", "x86_64").unwrap();
        assert_eq!(p.asset, "qdrant-x86_64-unknown-linux-musl.tar.gz");
        assert_eq!(p.binary_name(), "qdrant");
        assert_eq!(
            p.download_url("v1.16.3"),
            "https://github.com/qdrant/qdrant/releases/download/v1.16.3/qdrant-x86_64-unknown-linux-musl.tar.gz"
        );
        assert!(p.checksum_url("v1.16.3").ends_with(".tar.gz.sha256"));
    }

    #[test]
    fn windows_binary_has_exe_suffix() {
        let p = Platform::resolve("windows", "x86_64").unwrap();
        assert_eq!(p.binary_name(), "qdrant.exe");
    }

    #[test]
    fn unknown_platform_is_an_error() {
        assert!(matches!(
            Platform::resolve("plan9", "mips"),
            Err(LifecycleError::UnsupportedPlatform { .. })
        ));
    }

    #[test]
    fn checksum_takes_first_field() {
        let sum = "a".repeat(64);
        assert_eq!(
            parse_checksum(&format!("{}  qdrant.tar.gz\n", sum)),
            Some(sum)
        );
        assert_eq!(parse_checksum("not-a-hash file"), None);
        assert_eq!(parse_checksum(""), None);
    }
}
