use std::path::{Path, PathBuf};

/// What the user asked us to run. Scripts are resolved relative to the
/// code dir and invoked through the Python interpreter; anything else is
/// an opaque argv only the strategies without a wrapper binary can honor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    Script(PathBuf),
    Command(Vec<String>),
}

impl EntryPoint {
    /// Classifies a platform-supplied entry point string: `*.py` is a
    /// script, everything else is executed as-is.
    pub fn parse(entry_point: &str) -> Self {
        if Path::new(entry_point)
            .extension()
            .is_some_and(|ext| ext == "py")
        {
            EntryPoint::Script(PathBuf::from(entry_point))
        } else {
            EntryPoint::Command(vec![entry_point.to_string()])
        }
    }

    pub fn is_script(&self) -> bool {
        matches!(self, EntryPoint::Script(_))
    }
}
