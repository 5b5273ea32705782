//! The plugin ABI.
//!
//! External shared libraries expose three C entry points
//! (`context_new`/`context_delete`/`context_invoke`); this module describes
//! that `extern "C"` contract plus a [`PluginHost`] trait for dotted-method
//! dispatch (`regex.match`, `base64.encode`, `str.startswith`, … —
//! unprefixed names resolve under `builtin.`). No dynamic-library loader is
//! implemented here: loading a real `.so`/`.dylib`/`.dll` would pull in
//! `libloading`, and is left as a documented extension point (see
//! `DESIGN.md`) rather than fabricated.

use std::ffi::{c_char, CStr, CString};

/// An opaque plugin context handle, as returned by `context_new`.
pub type ContextHandle = *mut std::ffi::c_void;

/// Function pointer types for the three entry points every plugin shared
/// library exports under these exact symbol names, resolved from the loaded
/// library the way a loader built on `libloading`'s `Symbol` would.
///
/// # Safety
/// `context_new` returns a handle valid until passed to `context_delete`
/// exactly once; `context_invoke` must not retain its
/// `method`/`args_json`/`kwargs_json` pointers past the call, and its
/// returned pointer is owned by the caller (a host frees it by calling back
/// into the plugin's matching free function, not `CString::from_raw`
/// directly, since the allocator may differ).
pub type ContextNewFn = unsafe extern "C" fn() -> ContextHandle;
pub type ContextDeleteFn = unsafe extern "C" fn(ContextHandle);
pub type ContextInvokeFn =
    unsafe extern "C" fn(handle: ContextHandle, method: *const c_char, args_json: *const c_char, kwargs_json: *const c_char) -> *mut c_char;

/// A resolved dotted method name: `base64.encode` splits into
/// `namespace="base64"`, `name="encode"`; an unprefixed name like `match`
/// resolves under the implicit `builtin` namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodName {
    pub namespace: String,
    pub name: String,
}

impl MethodName {
    #[must_use]
    pub fn parse(dotted: &str) -> Self {
        match dotted.rsplit_once('.') {
            Some((namespace, name)) => Self { namespace: namespace.to_owned(), name: name.to_owned() },
            None => Self { namespace: "builtin".to_owned(), name: dotted.to_owned() },
        }
    }
}

/// An in-process plugin host: dispatches a dotted method name to a JSON-in,
/// JSON-out handler, the in-process equivalent of what `context_invoke`
/// does across the `extern "C"` boundary for an out-of-process plugin.
pub trait PluginHost {
    /// Invokes `method` with already-JSON-encoded `args`/`kwargs`, returning
    /// the JSON-encoded result or an error message.
    fn invoke(&self, method: &MethodName, args_json: &str, kwargs_json: &str) -> Result<String, String>;
}

/// A plugin's `INFO` descriptor: name, one-line description, and version,
/// as read from a plugin directory's `INFO` file").
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub describe: String,
    pub version: String,
}

/// Reads a NUL-terminated C string into an owned `String`, the counterpart
/// `context_invoke`'s caller uses on its `*mut c_char` result before asking
/// the plugin to free it.
///
/// # Safety
/// `ptr` must be a valid, NUL-terminated, UTF-8 C string pointer, or null.
#[must_use]
pub unsafe fn read_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: caller upholds this function's own safety contract (valid,
    // NUL-terminated UTF-8 C string for non-null `ptr`).
    unsafe { CStr::from_ptr(ptr) }.to_str().ok().map(str::to_owned)
}

#[must_use]
pub fn to_c_string(s: &str) -> CString {
    CString::new(s).unwrap_or_else(|_| CString::new("<invalid utf-8>").expect("ASCII fallback is always a valid CString"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_method_splits_namespace_and_name() {
        let m = MethodName::parse("regex.match");
        assert_eq!(m.namespace, "regex");
        assert_eq!(m.name, "match");
    }

    #[test]
    fn unprefixed_method_resolves_under_builtin() {
        let m = MethodName::parse("startswith");
        assert_eq!(m.namespace, "builtin");
        assert_eq!(m.name, "startswith");
    }
}
