use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::binary::{Binary, BinaryError};
use crate::ext::{
    AddressPartFeature, ComparatorFeature, MatchTypeFeature, fileinto, foreverypart, imap4flags,
    regex, variables,
};
use crate::extension::{Extension, ExtensionId, ExtensionRegistry, RegistryError};
use crate::interpreter::Interpreter;
use crate::result::SieveResult;
use crate::runtime::{ExecStatus, MessageData, RunStatus, ScriptEnv, SieveError};
use crate::wire;

/// Engine-wide policy limits.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub max_actions: usize,
    pub max_redirects: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { max_actions: 32, max_redirects: 4 }
    }
}

/// Identity of a script source; the engine never reads the source text
/// itself, it only hands it to the configured compiler.
#[derive(Clone, Debug)]
pub struct Script {
    pub name: String,
    pub path: Option<PathBuf>,
    pub source: Option<String>,
}

impl Script {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), path: None, source: None }
    }

    pub fn from_source(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self { name: name.into(), path: None, source: Some(source.into()) }
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        let path = self.path.as_ref()?;
        std::fs::metadata(path).ok()?.modified().ok()
    }
}

/// The excluded front-end (parser, validator, code generator) as an
/// injected collaborator.
pub trait ScriptCompiler: Send + Sync {
    fn compile(
        &self,
        registry: &Arc<ExtensionRegistry>,
        script: &Script,
    ) -> Result<Binary, SieveError>;
}

/// Outcome of one `execute`/`test` run.
#[derive(Clone, Debug)]
pub struct ExecOutcome {
    pub status: RunStatus,
    /// Whether the message was (or remains to be) kept in the default
    /// location.
    pub keep: bool,
    pub exec_status: ExecStatus,
}

/// The engine instance tying binaries, the extension registry, the
/// interpreter and the result together.
pub struct SieveEngine {
    registry: Arc<ExtensionRegistry>,
    config: EngineConfig,
    compiler: Option<Box<dyn ScriptCompiler>>,
}

impl Default for SieveEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SieveEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut registry = ExtensionRegistry::new();
        // Core language features modelled as preloaded extensions, then the
        // standard extensions. A fresh registry accepts all of these.
        let standard: [Arc<dyn Extension>; 8] = [
            Arc::new(MatchTypeFeature),
            Arc::new(ComparatorFeature),
            Arc::new(AddressPartFeature),
            Arc::new(fileinto::ExtFileinto),
            Arc::new(regex::ExtRegex),
            Arc::new(variables::ExtVariables),
            Arc::new(foreverypart::ExtForEveryPart),
            Arc::new(imap4flags::ExtImap4Flags),
        ];
        for ext in standard {
            registry.register(ext).expect("fresh registry accepts registrations");
        }
        Self { registry: Arc::new(registry), config, compiler: None }
    }

    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Space-separated capability string advertising the registered
    /// regular extensions, for ManageSieve-style capability listings.
    pub fn capabilities(&self) -> String {
        self.registry
            .iter()
            .filter(|(_, ext)| !ext.preloaded())
            .map(|(_, ext)| ext.capability().unwrap_or(ext.name()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Registers a host extension. Only possible before the registry is
    /// shared or frozen.
    pub fn register_extension(
        &mut self,
        ext: Arc<dyn Extension>,
    ) -> Result<ExtensionId, SieveError> {
        let registry = Arc::get_mut(&mut self.registry)
            .ok_or_else(|| SieveError::NotPossible("extension registry is shared".to_string()))?;
        registry.register(ext).map_err(|err: RegistryError| SieveError::NotPossible(err.to_string()))
    }

    pub fn set_compiler(&mut self, compiler: Box<dyn ScriptCompiler>) {
        self.compiler = Some(compiler);
    }

    /// Compiles a script through the injected front-end.
    pub fn compile(&self, script: &Script) -> Result<Binary, SieveError> {
        let compiler = self
            .compiler
            .as_ref()
            .ok_or_else(|| SieveError::NotPossible("no script compiler configured".to_string()))?;
        let binary = compiler.compile(&self.registry, script)?;
        debug!(script = %script.name, "script successfully compiled");
        Ok(binary)
    }

    /// Loads a saved binary from disk.
    pub fn load(&self, path: &Path) -> Result<Binary, SieveError> {
        wire::open(path, &self.registry, None).map_err(map_binary_error)
    }

    pub fn save(&self, binary: &mut Binary, path: &Path) -> Result<(), SieveError> {
        wire::save(binary, &self.registry, path)
            .map_err(|err| SieveError::NotPossible(err.to_string()))
    }

    /// Loads the compiled form of a script, recompiling (and re-saving)
    /// when the binary is missing, stale, of a foreign byte order, or of a
    /// different version.
    pub fn open(&self, script: &Script, bin_path: &Path) -> Result<Binary, SieveError> {
        match wire::open(bin_path, &self.registry, Some(script.name.clone())) {
            Ok(binary) => {
                if binary.up_to_date(script.mtime()) {
                    debug!(path = %bin_path.display(), "script binary successfully loaded");
                    return Ok(binary);
                }
                debug!(path = %bin_path.display(), "script binary is not up-to-date");
            }
            Err(err) => {
                debug!(path = %bin_path.display(), %err, "script binary not usable");
            }
        }

        let mut binary = self.compile(script)?;
        if let Err(err) = wire::save(&mut binary, &self.registry, bin_path) {
            // Not fatal; the freshly compiled binary is still usable.
            warn!(path = %bin_path.display(), %err, "failed to save script binary");
        }
        Ok(binary)
    }

    fn run(
        &self,
        binary: &Binary,
        msg: &MessageData,
        env: &ScriptEnv,
        result: &mut SieveResult,
    ) -> RunStatus {
        let mut interp = match Interpreter::new(&self.registry, binary, msg, env) {
            Ok(interp) => interp,
            Err(err) => {
                warn!(script = binary.script_name().unwrap_or("?"), "{err}");
                return err.status();
            }
        };
        match interp.run(result) {
            Ok(_) => RunStatus::Ok,
            Err(err) => {
                warn!(script = binary.script_name().unwrap_or("?"), "{err}");
                err.status()
            }
        }
    }

    /// Runs the script and commits the resulting action plan. A normal
    /// runtime failure falls back to the implicit keep; corrupt binaries
    /// surface to the caller for recompilation.
    pub fn execute(&self, binary: &Binary, msg: &MessageData, env: &ScriptEnv) -> ExecOutcome {
        let mut result = SieveResult::new(self.config.max_actions, self.config.max_redirects);
        let status = self.run(binary, msg, env, &mut result);
        let (status, keep) = match status {
            RunStatus::Ok => result.execute(msg, env),
            RunStatus::Failure => match result.perform_implicit_keep(msg, env) {
                Ok(()) => (RunStatus::Failure, true),
                Err(err) if err.temporary => (RunStatus::TempFailure, false),
                Err(_) => (RunStatus::KeepFailed, false),
            },
            other => (other, false),
        };
        ExecOutcome { status, keep, exec_status: result.exec_status().clone() }
    }

    /// Human-readable listing of a compiled binary.
    pub fn dump(&self, binary: &Binary) -> String {
        crate::dump::dump_binary(&self.registry, binary)
    }

    /// Dry run: prints the plan instead of committing it.
    pub fn test(
        &self,
        binary: &Binary,
        msg: &MessageData,
        env: &ScriptEnv,
        out: &mut dyn Write,
    ) -> std::io::Result<ExecOutcome> {
        let mut result = SieveResult::new(self.config.max_actions, self.config.max_redirects);
        let status = self.run(binary, msg, env, &mut result);
        let keep = if status == RunStatus::Ok { result.print(env, out)? } else { true };
        Ok(ExecOutcome { status, keep, exec_status: result.exec_status().clone() })
    }

    /// Starts a multiscript chain: several binaries share one result, and
    /// the implicit keep is deferred until the chain finishes.
    pub fn multiscript_start<'e>(
        &'e self,
        msg: &'e MessageData,
        env: &'e ScriptEnv,
    ) -> Multiscript<'e> {
        let mut result = SieveResult::new(self.config.max_actions, self.config.max_redirects);
        result.set_implicit_keep(false);
        Multiscript {
            engine: self,
            msg,
            env,
            result,
            status: RunStatus::Ok,
            keep: true,
            active: true,
            teststream: None,
        }
    }

    /// Multiscript in dry-run mode: each script's plan prints to `out`.
    pub fn multiscript_start_test<'e>(
        &'e self,
        msg: &'e MessageData,
        env: &'e ScriptEnv,
        out: Box<dyn Write + Send + 'e>,
    ) -> Multiscript<'e> {
        let mut mscript = self.multiscript_start(msg, env);
        mscript.teststream = Some(out);
        mscript
    }
}

fn map_binary_error(err: BinaryError) -> SieveError {
    match err {
        BinaryError::OpenFailed(message) | BinaryError::StatFailed(message) => {
            SieveError::NotFound(message)
        }
        other => SieveError::NotValid(other.to_string()),
    }
}

/// A chain of scripts filtering one message into one shared result. Each
/// script's actions commit as the chain advances; the implicit keep is
/// disabled between scripts and re-enabled for the finish.
pub struct Multiscript<'e> {
    engine: &'e SieveEngine,
    msg: &'e MessageData,
    env: &'e ScriptEnv,
    result: SieveResult,
    status: RunStatus,
    keep: bool,
    active: bool,
    teststream: Option<Box<dyn Write + Send + 'e>>,
}

impl<'e> Multiscript<'e> {
    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn keep(&self) -> bool {
        self.keep
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Runs one script against the shared result. Returns whether the
    /// chain is still active (the message has not been finally disposed
    /// of).
    pub fn run(&mut self, binary: &Binary) -> bool {
        if !self.active {
            return false;
        }

        self.status = self.engine.run(binary, self.msg, self.env, &mut self.result);

        match self.status {
            RunStatus::Ok => {
                self.keep = false;
                if let Some(stream) = self.teststream.as_mut() {
                    self.keep = self.result.print(self.env, stream.as_mut()).unwrap_or(true);
                    self.result.mark_executed();
                } else {
                    let (status, keep) = self.result.execute(self.msg, self.env);
                    self.status = status;
                    self.keep = keep;
                }
            }
            RunStatus::Failure => {
                // Runtime error mid-chain: the message must be saved now.
                self.keep = false;
                if self.teststream.is_some() {
                    self.keep = true;
                } else {
                    match self.result.perform_implicit_keep(self.msg, self.env) {
                        Ok(()) => self.keep = true,
                        Err(err) if err.temporary => self.status = RunStatus::TempFailure,
                        Err(_) => self.status = RunStatus::KeepFailed,
                    }
                }
            }
            _ => {}
        }

        self.active = self.active && self.keep && self.status == RunStatus::Ok;
        self.active
    }

    /// Ends the chain, re-enabling and performing the final implicit keep
    /// when the message is still in flow.
    pub fn finish(mut self) -> (RunStatus, bool) {
        self.result.set_implicit_keep(true);
        if self.active {
            if self.teststream.is_some() {
                self.keep = true;
            } else {
                match self.result.perform_implicit_keep(self.msg, self.env) {
                    Ok(()) => self.keep = true,
                    Err(err) if err.temporary && !self.result.executed() => {
                        self.status = RunStatus::TempFailure;
                        self.keep = false;
                    }
                    Err(_) => {
                        self.status = RunStatus::KeepFailed;
                        self.keep = false;
                    }
                }
            }
        }
        (self.status, self.keep)
    }

    /// Aborts the chain on a temporary condition; when part of the result
    /// already executed, falls back to the implicit keep so the message is
    /// not lost.
    pub fn tempfail(mut self) -> RunStatus {
        self.result.set_implicit_keep(true);
        if !self.active {
            return self.status;
        }
        if self.teststream.is_none() && self.result.executed() {
            match self.result.perform_implicit_keep(self.msg, self.env) {
                Ok(()) => RunStatus::Failure,
                Err(_) => RunStatus::KeepFailed,
            }
        } else {
            RunStatus::TempFailure
        }
    }
}
