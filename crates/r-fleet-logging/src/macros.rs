//! ---
//! fleet_section: "03-persistence-logging"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Context-enriched logging macros."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __fleet_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            thing = ctx.thing.unwrap_or(""),
            job = ctx.job.unwrap_or(""),
            shadow = ctx.shadow.unwrap_or(""),
            program = ctx.program.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with agent context.
#[macro_export]
macro_rules! fleet_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with agent context.
#[macro_export]
macro_rules! fleet_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with agent context.
#[macro_export]
macro_rules! fleet_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with agent context.
#[macro_export]
macro_rules! fleet_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__fleet_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
