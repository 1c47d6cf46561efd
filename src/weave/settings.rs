/// How argument containers are copied back into parameters after the entry hook
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CopyBack {
    /// Copy every argument back
    All,

    /// Only copy back arguments that a hook overwrote
    ModifiedOnly,
}

pub struct Settings {
    /// Suffix of the sibling method that keeps the original body (eg. `Run<Original>`)
    pub original_suffix: String,

    /// Field holding the hook descriptor on state-machine records
    pub aspect_field_name: String,

    /// Field holding the execution context on state-machine records
    pub context_field_name: String,

    /// Field holding the arguments container on state-machine records
    pub arguments_field_name: String,

    /// Field recording that `MoveNext` has run before (so the next call is a resumption)
    pub resume_flag_field_name: String,

    /// Field recording that the exit hook of an iterator is due (or has run)
    pub exit_flag_field_name: String,

    /// Three-state field tracking iterator disposal
    ///
    /// `0` when idle, `1` while the original `Dispose` runs, `2` while the exit hook runs.
    pub disposing_field_name: String,

    pub copy_back: CopyBack,

    /// Collect more than eight arguments into an object-array container
    ///
    /// When this is off, weaving such a method is an error.
    pub array_fallback: bool,

    /// Promote short branches that end up out of range after weaving
    pub widen_short_branches: bool,
}

impl Settings {
    pub fn new() -> Settings {
        Settings {
            original_suffix: String::from("<Original>"),
            aspect_field_name: String::from("*aspect*"),
            context_field_name: String::from("*aspectArgs*"),
            arguments_field_name: String::from("*args*"),
            resume_flag_field_name: String::from("*resumeFlag*"),
            exit_flag_field_name: String::from("*exitFlag*"),
            disposing_field_name: String::from("*isDisposing*"),
            copy_back: CopyBack::ModifiedOnly,
            array_fallback: true,
            widen_short_branches: true,
        }
    }

    /// Name of the sibling that keeps the original body of `name`
    pub fn original_name(&self, name: &str) -> String {
        format!("{}{}", name, self.original_suffix)
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings::new()
    }
}
