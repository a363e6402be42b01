//! Rhai entry point
//!
//! Runs a Rhai script as a supervised instance. Each load gets a fresh engine
//! whose native functions operate on the shared [`ModuleRegistry`]: scripts
//! define modules, classes and values, require other files, extend the load
//! path and keep state in globals. A script that defines `fn draw()` is
//! animated at its frame rate once its top level has run.
//!
//! Script functions cannot see top-level variables, so per-frame state lives
//! in globals (`set_global` / `get_global`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use relive_kernel::{
    DefinitionKind, EntryPoint, Instance, InstanceError, InstanceResult, ModuleRegistry,
    QualifiedName,
};
use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, Map, NativeCallContext, Scope};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Frames per second until a script calls `frame_rate`
pub const DEFAULT_FRAME_RATE: u64 = 60;

/// Script file extension, appended by `require` when a path has none
pub const SCRIPT_EXTENSION: &str = "rhai";

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Loads Rhai scripts as [`Instance`]s
#[derive(Debug, Clone)]
pub struct RhaiEntryPoint {
    frame_rate: u64,
}

impl Default for RhaiEntryPoint {
    fn default() -> Self {
        Self {
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

impl RhaiEntryPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_rate(mut self, fps: u64) -> Self {
        self.frame_rate = fps.max(1);
        self
    }
}

impl EntryPoint for RhaiEntryPoint {
    fn load(&self, path: &Path, registry: Arc<ModuleRegistry>) -> InstanceResult<Arc<dyn Instance>> {
        let flags = Arc::new(SketchFlags::new(self.frame_rate));
        let script_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| registry.working_dir().to_path_buf());

        let engine = build_engine(registry, flags.clone(), script_dir);
        let ast = engine
            .compile_file(path.to_path_buf())
            .map_err(|e| InstanceError::load(path, e))?;
        debug!("Compiled {}", path.display());

        Ok(Arc::new(RhaiSketch {
            path: path.to_path_buf(),
            engine: Arc::new(engine),
            ast: Arc::new(ast),
            flags,
        }))
    }
}

/// Where the script thread is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SketchPhase {
    Idle,
    Running,
    Exited,
}

/// Animation controls shared between the engine callbacks and the supervisor
#[derive(Debug)]
struct SketchFlags {
    animating: AtomicBool,
    closed: AtomicBool,
    frames: AtomicU64,
    fps: AtomicU64,
    phase: watch::Sender<SketchPhase>,
}

impl SketchFlags {
    fn new(fps: u64) -> Self {
        Self {
            animating: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            fps: AtomicU64::new(fps),
            phase: watch::Sender::new(SketchPhase::Idle),
        }
    }

    /// Claim the script thread; false once closed
    fn enter(&self) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase != SketchPhase::Idle {
                return false;
            }
            *phase = SketchPhase::Running;
            true
        })
    }

    fn is_animating(&self) -> bool {
        self.animating.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.load(Ordering::SeqCst).max(1) as f64)
    }
}

/// One run of a Rhai script
pub struct RhaiSketch {
    path: PathBuf,
    engine: Arc<Engine>,
    ast: Arc<AST>,
    flags: Arc<SketchFlags>,
}

/// Marks the script thread exited, also on unwind
struct ExitGuard<'a>(&'a SketchFlags);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.phase.send_replace(SketchPhase::Exited);
    }
}

#[async_trait]
impl Instance for RhaiSketch {
    async fn run(&self) -> InstanceResult<()> {
        let engine = self.engine.clone();
        let ast = self.ast.clone();
        let flags = self.flags.clone();
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            if !flags.enter() {
                debug!("{} closed before it started", path.display());
                return Ok(());
            }
            let _exit = ExitGuard(flags.as_ref());
            run_script(&engine, &ast, &flags, &path)
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                InstanceError::Panicked(e.to_string())
            } else {
                InstanceError::runtime("Script task was cancelled", e)
            }
        })?
    }

    fn stop_animating(&self) {
        self.flags.animating.store(false, Ordering::SeqCst);
    }

    fn close(&self) {
        self.flags.closed.store(true, Ordering::SeqCst);
        self.flags.phase.send_if_modified(|phase| {
            if *phase != SketchPhase::Idle {
                return false;
            }
            *phase = SketchPhase::Exited;
            true
        });
    }

    async fn wait_closed(&self) {
        let mut phase = self.flags.phase.subscribe();
        if phase.wait_for(|phase| *phase == SketchPhase::Exited).await.is_err() {
            debug!("{} phase channel closed", self.path.display());
        }
    }

    fn definition_name(&self) -> Option<QualifiedName> {
        let stem = self.path.file_stem()?.to_str()?;
        QualifiedName::parse(&camel_case(stem)).ok()
    }
}

/// Run the top level, then animate `draw` until stopped
fn run_script(engine: &Engine, ast: &AST, flags: &SketchFlags, path: &Path) -> InstanceResult<()> {
    let mut scope = Scope::new();
    if let Err(e) = engine.run_ast_with_scope(&mut scope, ast) {
        return script_outcome(e, flags, path);
    }

    if !ast.iter_functions().any(|f| f.name == "draw") {
        info!("{} has no draw function, ran once", path.display());
        return Ok(());
    }

    while flags.is_animating() {
        let started = Instant::now();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(false);
        if let Err(e) = engine.call_fn_with_options::<Dynamic>(options, &mut scope, ast, "draw", ())
        {
            return script_outcome(e, flags, path);
        }
        flags.frames.fetch_add(1, Ordering::SeqCst);

        if let Some(rest) = flags.frame_duration().checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    debug!(
        "{} stopped after {} frames",
        path.display(),
        flags.frames.load(Ordering::SeqCst)
    );
    Ok(())
}

/// A termination caused by `close` is a normal end
fn script_outcome(err: Box<EvalAltResult>, flags: &SketchFlags, path: &Path) -> InstanceResult<()> {
    if flags.is_closed() && matches!(*err, EvalAltResult::ErrorTerminated(..)) {
        debug!("{} terminated on close", path.display());
        return Ok(());
    }
    Err(InstanceError::runtime(
        format!("{} raised an error", path.display()),
        err,
    ))
}

fn build_engine(registry: Arc<ModuleRegistry>, flags: Arc<SketchFlags>, script_dir: PathBuf) -> Engine {
    let mut engine = Engine::new();

    let progress_flags = flags.clone();
    engine.on_progress(move |_| progress_flags.is_closed().then_some(Dynamic::UNIT));
    engine.on_print(|text| info!(target: "relive::script", "{}", text));
    engine.on_debug(|text, source, pos| {
        debug!(target: "relive::script", "{} {:?} {}", source.unwrap_or("script"), pos, text)
    });

    register_definitions(&mut engine, registry.clone());
    register_loading(&mut engine, registry.clone(), flags.clone(), script_dir);
    register_globals(&mut engine, registry);
    register_animation(&mut engine, flags);

    engine
}

fn register_definitions(engine: &mut Engine, registry: Arc<ModuleRegistry>) {
    let r = registry.clone();
    engine.register_fn("define_module", move |name: &str| -> ScriptResult<()> {
        define(&r, name, DefinitionKind::Module)
    });

    let r = registry.clone();
    engine.register_fn("define_class", move |name: &str| -> ScriptResult<()> {
        define(&r, name, DefinitionKind::Class)
    });

    let r = registry.clone();
    engine.register_fn(
        "define_value",
        move |name: &str, value: Dynamic| -> ScriptResult<()> {
            define(&r, name, DefinitionKind::Value(dynamic_to_json(&value)))
        },
    );

    engine.register_fn("is_defined", move |name: &str| -> bool {
        QualifiedName::parse(name).is_ok_and(|name| registry.contains(&name))
    });
}

fn register_loading(
    engine: &mut Engine,
    registry: Arc<ModuleRegistry>,
    flags: Arc<SketchFlags>,
    script_dir: PathBuf,
) {
    let r = registry.clone();
    engine.register_fn(
        "require",
        move |ctx: NativeCallContext, path: &str| -> ScriptResult<bool> {
            let resolved = resolve_require(&r, &script_dir, path)
                .ok_or_else(|| script_error(format!("cannot find {} to require", path)))?;
            if !r.record_loaded(&resolved) {
                return Ok(false);
            }

            debug!("Requiring {}", resolved.display());
            if let Err(e) = ctx.engine().run_file(resolved.clone()) {
                // once closed, the records belong to the purge and the next instance
                if flags.is_closed() {
                    return Err(e);
                }
                // a failed require may be retried
                if let Err(forget) = r.forget_loaded(&resolved) {
                    warn!("Cannot forget failed require of {}: {}", resolved.display(), forget);
                }
                return Err(e);
            }
            Ok(true)
        },
    );

    engine.register_fn("add_load_path", move |dir: &str| {
        registry.add_load_path(dir);
    });
}

fn register_globals(engine: &mut Engine, registry: Arc<ModuleRegistry>) {
    let r = registry.clone();
    engine.register_fn("set_global", move |name: &str, value: Dynamic| {
        r.set_global(name, dynamic_to_json(&value));
    });

    engine.register_fn("get_global", move |name: &str| -> Dynamic {
        registry
            .global(name)
            .map(|value| json_to_dynamic(&value))
            .unwrap_or(Dynamic::UNIT)
    });
}

fn register_animation(engine: &mut Engine, flags: Arc<SketchFlags>) {
    let f = flags.clone();
    engine.register_fn("frame_count", move || -> i64 {
        f.frames.load(Ordering::SeqCst) as i64
    });

    engine.register_fn("frame_rate", move |fps: i64| -> ScriptResult<()> {
        if fps <= 0 {
            return Err(script_error(format!("frame rate must be positive, got {}", fps)));
        }
        flags.fps.store(fps as u64, Ordering::SeqCst);
        Ok(())
    });
}

fn define(registry: &ModuleRegistry, name: &str, kind: DefinitionKind) -> ScriptResult<()> {
    let name = QualifiedName::parse(name).map_err(script_error)?;
    registry.define(&name, kind).map_err(script_error)
}

/// Absolute paths as-is, then each load path, then the script's directory
fn resolve_require(registry: &ModuleRegistry, script_dir: &Path, path: &str) -> Option<PathBuf> {
    let mut requested = PathBuf::from(path);
    if requested.extension().is_none() {
        requested.set_extension(SCRIPT_EXTENSION);
    }

    if requested.is_absolute() {
        return requested.is_file().then_some(requested);
    }

    registry
        .load_paths()
        .into_iter()
        .chain(std::iter::once(script_dir.to_path_buf()))
        .map(|dir| registry.normalize(dir.join(&requested)))
        .find(|candidate| candidate.is_file())
}

fn script_error(err: impl std::fmt::Display) -> Box<EvalAltResult> {
    err.to_string().into()
}

/// `bouncing_ball` ⇒ `BouncingBall`
fn camel_case(stem: &str) -> String {
    stem.split(|c: char| c == '_' || c == '-' || c == ' ' || c == '.')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

fn json_to_dynamic(value: &serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        serde_json::Value::String(s) => Dynamic::from(s.clone()),
        serde_json::Value::Array(items) => {
            Dynamic::from(items.iter().map(json_to_dynamic).collect::<Vec<Dynamic>>())
        }
        serde_json::Value::Object(obj) => {
            let mut map = Map::new();
            for (k, v) in obj {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from(map)
        }
    }
}

fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    if value.is_unit() {
        serde_json::Value::Null
    } else if let Ok(b) = value.as_bool() {
        serde_json::Value::Bool(b)
    } else if let Ok(i) = value.as_int() {
        serde_json::json!(i)
    } else if let Ok(f) = value.as_float() {
        serde_json::json!(f)
    } else if value.is_string() {
        serde_json::Value::String(value.to_string())
    } else if value.is_array() {
        let items = value.clone().cast::<rhai::Array>();
        serde_json::Value::Array(items.iter().map(dynamic_to_json).collect())
    } else if value.is_map() {
        let map = value.clone().cast::<Map>();
        serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), dynamic_to_json(v)))
                .collect(),
        )
    } else {
        serde_json::Value::String(value.to_string())
    }
}
