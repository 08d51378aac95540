/// Log-and-drop helper for errors that must not stop a background loop.
pub trait ResultOkLogExt<T, E> {
    /// Logs the error at error level, prefixed with `context`, and converts the
    /// result into an [`Option`].
    fn ok_log_context(self, context: &str) -> Option<T>;
}

impl<T, E> ResultOkLogExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error,
{
    fn ok_log_context(self, context: &str) -> Option<T> {
        match self {
            Ok(ok) => Some(ok),
            Err(err) => {
                log::error!("{context}: {err}");
                None
            }
        }
    }
}
