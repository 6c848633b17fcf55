// src/interpreter/hooks.rs
//! Capture hook registry.
//!
//! A hook is a named, reversible rebinding of a callable inside the worker
//! runtime, expressed as a Python block spliced into the worker driver's
//! prelude. Each block must end by passing a zero-argument context manager
//! to `_register_hook(...)`; the driver enters all registered hooks in
//! registration order around every code execution (an `ExitStack`, so prior
//! bindings are restored on every exit path), and rebinding goes through the
//! driver's `Switchable` helper which keeps the original callable reachable
//! behind an explicit handle.
//!
//! The registry is process-wide. Hooks registered before a worker is spawned
//! are baked into that worker's driver; hooks added later apply only to
//! workers started afterward.

use std::sync::{Mutex, OnceLock};

/// A scoped rebinding of a runtime callable, as driver prelude source.
#[derive(Debug, Clone)]
pub struct CaptureHook {
    /// Short identifier, used for logging only.
    pub name: String,
    /// Python block; must call `_register_hook(fn)` with a context manager.
    pub source: String,
}

impl CaptureHook {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// Ordered collection of capture hooks.
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: Vec<CaptureHook>,
}

impl HookRegistry {
    pub fn add(&mut self, hook: CaptureHook) {
        self.hooks.push(hook);
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Concatenate hook blocks in registration order for the driver prelude.
    pub fn prelude(&self) -> String {
        let mut prelude = String::new();
        for hook in &self.hooks {
            prelude.push_str(&hook.source);
            if !hook.source.ends_with('\n') {
                prelude.push('\n');
            }
            prelude.push('\n');
        }
        prelude
    }
}

fn global_registry() -> &'static Mutex<HookRegistry> {
    static REGISTRY: OnceLock<Mutex<HookRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HookRegistry::default()))
}

/// Register hooks for all workers spawned from now on.
pub fn add_hooks(hooks: impl IntoIterator<Item = CaptureHook>) {
    let mut registry = global_registry().lock().unwrap_or_else(|e| e.into_inner());
    for hook in hooks {
        registry.add(hook);
    }
}

/// Drop every registered hook.
pub fn clear_hooks() {
    global_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}

/// Snapshot the current prelude; called once per worker spawn.
pub fn prelude_snapshot() -> String {
    global_registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .prelude()
}

/// Prebuilt hooks for common capture targets.
pub mod prebuilt {
    use super::CaptureHook;

    /// Capture `sys.stdout` / `sys.stderr` writes as stream frames.
    pub fn stdout_stderr_capture() -> CaptureHook {
        CaptureHook::new(
            "stdout_stderr_capture",
            r#"
@contextmanager
def _capture_stdout_stderr():
    out = Switchable(sys.stdout, "write")
    err = Switchable(sys.stderr, "write")
    with out.switch_to(lambda s: _emit_stream("stdout", s)), \
         err.switch_to(lambda s: _emit_stream("stderr", s)):
        yield

_register_hook(_capture_stdout_stderr)
"#,
        )
    }

    /// Capture `matplotlib.pyplot.show` as PNG figure frames.
    ///
    /// Inert when matplotlib is not importable in the worker's environment.
    pub fn matplotlib_show_capture() -> CaptureHook {
        CaptureHook::new(
            "matplotlib_show_capture",
            r#"
@contextmanager
def _capture_matplotlib_show():
    try:
        import matplotlib
        matplotlib.use("Agg", force=True)
        from matplotlib import pyplot
    except Exception:
        yield
        return

    def _captured_show(*args, **kwargs):
        buffer = io.BytesIO()
        try:
            pyplot.savefig(buffer, format="png")
            _emit_bytes("figure", buffer.getvalue())
        finally:
            buffer.close()
            pyplot.close()

    show = Switchable(pyplot, "show")
    use_backend = Switchable(matplotlib, "use")
    with show.switch_to(_captured_show), \
         use_backend.switch_to(lambda *a, **k: None):
        yield

_register_hook(_capture_matplotlib_show)
"#,
        )
    }

    /// Capture `PIL.Image.show` as PNG image frames.
    ///
    /// Inert when Pillow is not importable in the worker's environment.
    pub fn pillow_show_capture() -> CaptureHook {
        CaptureHook::new(
            "pillow_show_capture",
            r#"
@contextmanager
def _capture_pillow_show():
    try:
        from PIL import Image
    except Exception:
        yield
        return

    def _captured_show(image, **options):
        buffer = io.BytesIO()
        try:
            image.save(buffer, format="PNG")
            _emit_bytes("image", buffer.getvalue())
        finally:
            buffer.close()

    show = Switchable(Image, "_show")
    with show.switch_to(_captured_show):
        yield

_register_hook(_capture_pillow_show)
"#,
        )
    }

    /// The hook set the server installs by default.
    pub fn default_hooks() -> Vec<CaptureHook> {
        vec![
            stdout_stderr_capture(),
            matplotlib_show_capture(),
            pillow_show_capture(),
        ]
    }
}
