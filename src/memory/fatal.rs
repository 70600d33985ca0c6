//! Fatal-error diagnostics.
//!
//! Every condition the manager treats as unrecoverable emits a diagnostic of
//! the form
//!
//! ```text
//! error in function F (FILE:LINE):
//! <message>
//! ```
//!
//! to standard error and then panics with the same message.  Deployments that
//! require hard termination build with `panic = "abort"`; under the default
//! unwinding strategy the misuse paths remain testable via `#[should_panic]`.

/// Expands to the path of the enclosing function.
macro_rules! func_path {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        name.strip_suffix("::f").unwrap_or(name)
    }};
}
pub(crate) use func_path;

/// Emit the fatal diagnostic line to stderr, then panic with the message.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        eprintln!(
            "error in function {} ({}:{}):\n{}",
            crate::memory::fatal::func_path!(),
            file!(),
            line!(),
            msg,
        );
        panic!("{}", msg);
    }};
}
pub(crate) use fatal;

#[cfg(all(test, not(loom)))]
mod tests {
    #[test]
    fn test_func_path_names_enclosing_function() {
        let path = super::func_path!();
        assert!(
            path.ends_with("test_func_path_names_enclosing_function"),
            "unexpected function path: {path}"
        );
    }
}
