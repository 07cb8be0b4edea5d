//! Naming of the per-platform native library stored in an archive.

use std::env::consts::{ARCH, OS};

/// Architecture tag, e.g. `x64` or `arm64`; unknown values keep a `raw` prefix.
pub fn arch_tag(arch: &str) -> String {
    match arch {
        "x86_64" | "amd64" => "x64".to_string(),
        "aarch64" => "arm64".to_string(),
        "arm" => "arm32".to_string(),
        "x86" => "x86".to_string(),
        other => format!("raw{other}"),
    }
}

/// OS tag with its library suffix, e.g. `linux.so`.
pub fn os_suffix(os: &str) -> String {
    match os {
        "linux" | "android" | "freebsd" | "netbsd" | "openbsd" | "aix" => "linux.so".to_string(),
        "windows" => "windows.dll".to_string(),
        "macos" | "ios" => "macos.dylib".to_string(),
        other => format!("raw{other}"),
    }
}

/// Library file name for an explicit OS/arch pair.
pub fn library_name(os: &str, arch: &str) -> String {
    format!("{}-{}", arch_tag(arch), os_suffix(os))
}

/// Library file name for the running platform, e.g. `x64-linux.so`.
pub fn native_library_name() -> String {
    library_name(OS, ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_platforms() {
        assert_eq!(library_name("linux", "x86_64"), "x64-linux.so");
        assert_eq!(library_name("macos", "aarch64"), "arm64-macos.dylib");
        assert_eq!(library_name("windows", "x86"), "x86-windows.dll");
    }

    #[test]
    fn test_unknown_platforms_keep_raw_names() {
        assert_eq!(library_name("haiku", "riscv64"), "rawriscv64-rawhaiku");
    }

    #[test]
    fn test_native_name_has_two_parts() {
        let name = native_library_name();
        assert!(name.contains('-'), "{name}");
    }
}
