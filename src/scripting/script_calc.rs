//! Rhai implementation of the calculation module.

use crate::calc::{EnergyCff, MonoCalculator};
use crate::config::CalculationConfig;
use crate::error::{AppResult, CalcError};
use async_trait::async_trait;
use rhai::{Array, CallFnOptions, Dynamic, Engine, EvalAltResult, FuncArgs, Map, Scope, AST};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Energy and cff.
pub const ENERGY_FN: &str = "calc_E";
/// Bandwidth.
pub const BANDWIDTH_FN: &str = "calc_BW";
/// Active grating.
pub const GRATING_FN: &str = "get_grating";
/// Optional dependency declaration.
pub const REQUIRES_FN: &str = "requires";

/// Functions the script must define, with their arity.
const REQUIRED_FNS: [(&str, usize); 3] = [(ENERGY_FN, 2), (BANDWIDTH_FN, 3), (GRATING_FN, 0)];

/// Map a namespace name such as `rix.db` to the identifier scripts use.
pub fn stub_identifier(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Calculation module loaded from a Rhai file.
///
/// The engine, compiled AST and the scope produced by running the file's
/// top-level statements are shared read-only; each call gets its own copy of
/// the scope and runs on the blocking pool.
pub struct ScriptCalculator {
    engine: Arc<Engine>,
    ast: Arc<AST>,
    scope: Arc<Scope<'static>>,
    module_name: String,
    path: PathBuf,
    stubs: BTreeSet<String>,
}

impl std::fmt::Debug for ScriptCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptCalculator")
            .field("module_name", &self.module_name)
            .field("path", &self.path)
            .field("stubs", &self.stubs)
            .finish()
    }
}

impl ScriptCalculator {
    /// Load the module described by the calculation settings.
    pub fn from_settings(config: &CalculationConfig) -> AppResult<Self> {
        Self::load(
            &config.path,
            &config.module_name,
            &config.stub_namespaces,
            config.max_operations,
        )
    }

    /// Read and compile the file at `path`.
    pub fn load(
        path: &Path,
        module_name: &str,
        stub_namespaces: &[String],
        max_operations: u64,
    ) -> AppResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| CalcError::ScriptLoad {
            module: module_name.to_string(),
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_source(&source, path, module_name, stub_namespaces, max_operations)
    }

    /// Compile `source` as if it had been read from `path`.
    pub fn from_source(
        source: &str,
        path: &Path,
        module_name: &str,
        stub_namespaces: &[String],
        max_operations: u64,
    ) -> AppResult<Self> {
        let load_error = |message: String| CalcError::ScriptLoad {
            module: module_name.to_string(),
            path: path.to_path_buf(),
            message,
        };

        let mut engine = new_engine(module_name, max_operations);
        let ast = engine
            .compile(source)
            .map_err(|e| load_error(e.to_string()))?;

        for (name, arity) in REQUIRED_FNS {
            if !has_function(&ast, name, arity) {
                return Err(load_error(format!(
                    "missing function {}() taking {} argument(s)",
                    name, arity
                )));
            }
        }

        let mut stubs: BTreeSet<String> =
            stub_namespaces.iter().map(|n| stub_identifier(n)).collect();
        if has_function(&ast, REQUIRES_FN, 0) {
            for name in declared_requirements(&engine, &ast).map_err(load_error)? {
                stubs.insert(stub_identifier(&name));
            }
        }
        install_stubs(&mut engine, &stubs);

        // Run top-level statements once, the way importing a module would
        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| load_error(e.to_string()))?;

        info!(
            "Loaded calculation module '{}' from {:?} (stubs: {:?})",
            module_name, path, stubs
        );

        Ok(Self {
            engine: Arc::new(engine),
            ast: Arc::new(ast),
            scope: Arc::new(scope),
            module_name: module_name.to_string(),
            path: path.to_path_buf(),
            stubs,
        })
    }

    /// Logical module name.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// File the module was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifiers bound to stub namespaces.
    pub fn stubs(&self) -> impl Iterator<Item = &str> {
        self.stubs.iter().map(String::as_str)
    }

    async fn call<A>(&self, function: &'static str, args: A) -> AppResult<Dynamic>
    where
        A: FuncArgs + Send + 'static,
    {
        let engine = self.engine.clone();
        let ast = self.ast.clone();
        let mut scope = (*self.scope).clone();

        // Execute in a blocking task to avoid blocking the async runtime
        tokio::task::spawn_blocking(move || {
            let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
            engine
                .call_fn_with_options::<Dynamic>(options, &mut scope, &ast, function, args)
                .map_err(|e| convert_rhai_error(function, e))
        })
        .await
        .map_err(|e| CalcError::Join(format!("Task join error: {}", e)))?
    }
}

#[async_trait]
impl MonoCalculator for ScriptCalculator {
    async fn energy_and_cff(
        &self,
        grating_pitch: f64,
        mirror_pitch: f64,
    ) -> AppResult<EnergyCff> {
        let result = self.call(ENERGY_FN, (grating_pitch, mirror_pitch)).await?;
        let mismatch = |found: String| CalcError::ScriptResult {
            function: ENERGY_FN.to_string(),
            expected: "[energy, cff]".to_string(),
            found,
        };
        let found = result.type_name().to_string();
        let pair: Array = result.try_cast::<Array>().ok_or_else(|| mismatch(found))?;
        match pair.as_slice() {
            [energy, cff] => Ok(EnergyCff {
                energy: as_number(energy).ok_or_else(|| mismatch(energy.type_name().into()))?,
                cff: as_number(cff).ok_or_else(|| mismatch(cff.type_name().into()))?,
            }),
            other => Err(mismatch(format!("array of length {}", other.len()))),
        }
    }

    async fn bandwidth(
        &self,
        exit_gap: f64,
        grating_pitch: f64,
        mirror_pitch: f64,
    ) -> AppResult<f64> {
        let result = self
            .call(BANDWIDTH_FN, (exit_gap, grating_pitch, mirror_pitch))
            .await?;
        as_number(&result).ok_or_else(|| CalcError::ScriptResult {
            function: BANDWIDTH_FN.to_string(),
            expected: "number".to_string(),
            found: result.type_name().to_string(),
        })
    }

    async fn grating(&self) -> AppResult<String> {
        let result = self.call(GRATING_FN, ()).await?;
        let found = result.type_name().to_string();
        result.into_string().map_err(|_| CalcError::ScriptResult {
            function: GRATING_FN.to_string(),
            expected: "string".to_string(),
            found,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn new_engine(module_name: &str, max_operations: u64) -> Engine {
    let mut engine = Engine::new();

    // Safety: Limit operations to prevent infinite loops
    engine.on_progress(move |count| {
        if count > max_operations {
            Some(format!("Safety limit exceeded: maximum {} operations", max_operations).into())
        } else {
            None
        }
    });

    let print_module = module_name.to_string();
    engine.on_print(move |text| info!(module = %print_module, "{}", text));
    let debug_module = module_name.to_string();
    engine.on_debug(move |text, _source, pos| {
        debug!(module = %debug_module, position = %pos, "{}", text)
    });

    engine
}

fn has_function(ast: &AST, name: &str, arity: usize) -> bool {
    ast.iter_functions()
        .any(|f| f.name == name && f.params.len() == arity)
}

fn declared_requirements(engine: &Engine, ast: &AST) -> Result<Vec<String>, String> {
    let mut scope = Scope::new();
    let options = CallFnOptions::new().eval_ast(false);
    let declared = engine
        .call_fn_with_options::<Dynamic>(options, &mut scope, ast, REQUIRES_FN, ())
        .map_err(|e| format!("{}() failed: {}", REQUIRES_FN, e))?;
    let found = declared.type_name();
    let items = declared
        .try_cast::<Array>()
        .ok_or_else(|| format!("{}() must return an array of strings, got {}", REQUIRES_FN, found))?;
    items
        .into_iter()
        .map(|item| {
            let found = item.type_name();
            item.into_string()
                .map_err(|_| format!("{}() entries must be strings, got {}", REQUIRES_FN, found))
        })
        .collect()
}

#[allow(deprecated)]
fn install_stubs(engine: &mut Engine, stubs: &BTreeSet<String>) {
    if stubs.is_empty() {
        return;
    }
    let stubs = stubs.clone();
    // Unknown properties on an object map read as `()`
    engine.on_var(move |name, _index, _context| {
        if stubs.contains(name) {
            Ok(Some(Dynamic::from_map(Map::new())))
        } else {
            Ok(None)
        }
    });
}

fn as_number(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|v| v as f64))
}

/// Convert Rhai's EvalAltResult to our error type
///
/// Errors raised inside a script function arrive wrapped in the call chain;
/// the innermost cause is what gets reported.
fn convert_rhai_error(function: &str, error: Box<EvalAltResult>) -> CalcError {
    let message = match *error {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => {
            return convert_rhai_error(function, inner)
        }
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        EvalAltResult::ErrorTerminated(token, _) => format!("Script terminated: {}", token),
        other => other.to_string(),
    };
    CalcError::Script {
        function: function.to_string(),
        message,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
