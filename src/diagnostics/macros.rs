//! Diagnostic macros.

/// Emit a predefined diagnostic to a sink, optionally with context.
///
/// # Example
///
/// ```rust,ignore
/// sd_emit!(sink, SD301);
/// sd_emit!(sink, SD201, error.to_string());
/// ```
#[macro_export]
macro_rules! sd_emit {
    ($sink:expr, $code:ident) => {{
        $crate::diagnostics::DiagnosticSink::emit(&$sink, &$crate::diagnostics::$code, None);
    }};
    ($sink:expr, $code:ident, $context:expr) => {{
        let context: String = ::std::string::ToString::to_string(&$context);
        $crate::diagnostics::DiagnosticSink::emit(
            &$sink,
            &$crate::diagnostics::$code,
            Some(context.as_str()),
        );
    }};
}

/// Emit a diagnostic only the first time `$flag` is seen unset.
///
/// `$flag` is an `AtomicBool`; repeated hot-path failures log once.
#[macro_export]
macro_rules! sd_emit_once {
    ($flag:expr, $sink:expr, $code:ident $(, $context:expr)?) => {{
        if !$flag.swap(true, ::std::sync::atomic::Ordering::Relaxed) {
            $crate::sd_emit!($sink, $code $(, $context)?);
        }
    }};
}

#[cfg(test)]
mod tests {
    use crate::diagnostics::{CollectingSink, DiagnosticSink};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_emit_through_any_sink_handle() {
        let collecting = Arc::new(CollectingSink::new());
        let shared: Arc<dyn DiagnosticSink> = Arc::clone(&collecting) as Arc<dyn DiagnosticSink>;
        let borrowed = &shared;

        sd_emit!(shared, SD301);
        sd_emit!(borrowed, SD302, "no primitive");
        sd_emit!(*collecting, SD401);

        assert_eq!(collecting.codes(), vec!["SD301", "SD302", "SD401"]);
    }

    #[test]
    fn test_emit_once() {
        let sink = CollectingSink::new();
        let flag = AtomicBool::new(false);
        for _ in 0..3 {
            sd_emit_once!(flag, sink, SD101, "object 0x10");
        }
        assert_eq!(sink.codes(), vec!["SD101"]);
    }
}
