//! Demangling for Rust, C++ (Itanium) and MSVC symbol names.

/// Demangle `name`, or None when it is not a mangling we recognize.
pub fn demangle(name: &str) -> Option<String> {
    // Rust (v0 + legacy); `{:#}` drops the hash suffix
    if let Ok(dm) = rustc_demangle::try_demangle(name) {
        return Some(format!("{dm:#}"));
    }
    if name.starts_with("_Z") {
        if let Ok(sym) = cpp_demangle::Symbol::new(name) {
            return Some(sym.to_string());
        }
    }
    if name.starts_with('?') {
        if let Ok(out) = msvc_demangler::demangle(name, msvc_demangler::DemangleFlags::COMPLETE) {
            return Some(out);
        }
    }
    None
}

/// Demangled form of `name`, falling back to `name` itself.
pub fn demangle_or_original(name: &str) -> String {
    demangle(name).unwrap_or_else(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rust_legacy() {
        assert_eq!(
            demangle("_ZN4core3fmt5write17h0123456789abcdefE").as_deref(),
            Some("core::fmt::write")
        );
    }

    #[test]
    fn test_itanium() {
        assert_eq!(demangle("_Z3addii").as_deref(), Some("add(int, int)"));
    }

    #[test]
    fn test_msvc() {
        let out = demangle("?compute@@YAHH@Z").unwrap();
        assert!(out.contains("compute"));
    }

    #[test]
    fn test_plain_names_pass_through() {
        assert_eq!(demangle("WinMain"), None);
        assert_eq!(demangle_or_original("WinMain"), "WinMain");
    }
}
