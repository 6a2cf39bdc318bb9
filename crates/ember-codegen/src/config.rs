// Per-target configuration for IR construction.

/// How function values are represented for the current target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncValueMode {
    /// `{context, raw function pointer}`. Calling extracts both fields and
    /// calls directly.
    Doubleword,
    /// `{context, address of a constant {function address, signature}
    /// record}`. Calling goes through the `get_func_ptr` runtime helper,
    /// which the lowering pass turns into a per-signature switch.
    SignatureTagged,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub func_values: FuncValueMode,
    /// Report defer-frame stack allocations to the collector. Required on
    /// targets where the collector scans tracked objects instead of
    /// conservatively scanning stacks.
    pub track_stack_objects: bool,
    /// Retain the textual IR of each compiled function, keyed by link name.
    pub dump_ir: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            func_values: FuncValueMode::SignatureTagged,
            track_stack_objects: false,
            dump_ir: false,
        }
    }
}
