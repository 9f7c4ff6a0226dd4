//! Compiled-unit storage
//!
//! Native units are opened from private shadow copies and never unmapped;
//! leases on the opened image decide when a unit counts as reclaimed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{anyhow, bail, Context, Result};
use libloading::{Library, Symbol};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::manifest::{UnitManifest, UnitManifestFn, UNIT_ABI_VERSION, UNIT_MANIFEST_SYMBOL};

/// Where compiled units come from.
pub trait UnitStorage: Send + Sync {
    /// Location of the unit called `name`.
    fn locate(&self, name: &str) -> PathBuf;

    /// Whether a unit exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Open the unit at `path` and read its registration table.
    fn open(&self, path: &Path) -> Result<UnitImage>;
}

/// An opened compiled unit.
///
/// Dropping the last `Arc<UnitImage>` closes the native library, which is
/// what the registry observes as reclamation.
pub struct UnitImage {
    source: PathBuf,
    manifest: UnitManifest,
    library: Option<NativeLibrary>,
}

/// The unit library drops before the dependencies it was linked against.
struct NativeLibrary {
    _unit: Library,
    _dependencies: Vec<Library>,
}

impl UnitImage {
    #[must_use]
    pub fn from_manifest(source: impl Into<PathBuf>, manifest: UnitManifest) -> Self {
        Self {
            source: source.into(),
            manifest,
            library: None,
        }
    }

    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    #[must_use]
    pub fn manifest(&self) -> &UnitManifest {
        &self.manifest
    }

    #[must_use]
    pub fn is_native(&self) -> bool {
        self.library.is_some()
    }
}

impl std::fmt::Debug for UnitImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitImage")
            .field("source", &self.source)
            .field("modules", &self.manifest.modules.len())
            .field("native", &self.is_native())
            .finish()
    }
}

/// Declared dependencies of a unit, read from `<name>.deps.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyManifest {
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl DependencyManifest {
    /// Sidecar path for the unit at `unit_path`.
    #[must_use]
    pub fn path_for(unit_path: &Path) -> PathBuf {
        unit_path.with_extension("deps.yaml")
    }

    /// Read the sidecar if present; a unit without one has no dependencies.
    pub fn load_for(unit_path: &Path) -> Result<Self> {
        let path = Self::path_for(unit_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Resolves dependency names against the unit's own directory only.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    root: PathBuf,
}

impl DependencyResolver {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return None;
        }
        let extension = std::env::consts::DLL_EXTENSION;
        let file_name = if Path::new(name).extension().and_then(|e| e.to_str()) == Some(extension)
        {
            name.to_string()
        } else {
            format!("{name}.{extension}")
        };
        let path = self.root.join(file_name);
        path.is_file().then_some(path)
    }
}

/// Units stored as native libraries: `<directory>/<name>.<DLL_EXTENSION>`.
///
/// Every open maps a fresh shadow copy of the file, so a rebuilt unit is
/// picked up on reload instead of the still-resident earlier incarnation.
#[derive(Debug, Clone)]
pub struct DylibStorage {
    directory: PathBuf,
    shadow_dir: PathBuf,
}

impl DylibStorage {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            shadow_dir: std::env::temp_dir().join("cogworks-shadow"),
        }
    }

    /// Place shadow copies in `shadow_dir` instead of the system temp directory.
    #[must_use]
    pub fn with_shadow_dir(mut self, shadow_dir: impl Into<PathBuf>) -> Self {
        self.shadow_dir = shadow_dir.into();
        self
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn shadow_dir(&self) -> &Path {
        &self.shadow_dir
    }

    fn shadow_copy(&self, path: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.shadow_dir).with_context(|| {
            format!("Failed to create shadow directory {}", self.shadow_dir.display())
        })?;
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("unit");
        let shadow = self.shadow_dir.join(format!(
            "{stem}-{}.{}",
            Uuid::new_v4().simple(),
            std::env::consts::DLL_EXTENSION
        ));
        fs::copy(path, &shadow).with_context(|| {
            format!("Failed to copy {} to {}", path.display(), shadow.display())
        })?;
        Ok(shadow)
    }
}

#[cfg(unix)]
fn open_isolated(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};

    // RTLD_LOCAL keeps its symbols out of the global namespace of other units.
    // RTLD_NODELETE keeps the code mapped after the last close: thread-local
    // destructors registered from unit code run at thread exit.
    let flags = RTLD_NOW | RTLD_LOCAL | libc::RTLD_NODELETE;
    // SAFETY: Loading a unit runs its initializers; units are trusted local code.
    unsafe { UnixLibrary::open(Some(path), flags) }.map(Library::from)
}

#[cfg(not(unix))]
fn open_isolated(path: &Path) -> Result<Library, libloading::Error> {
    // SAFETY: Loading a unit runs its initializers; units are trusted local code.
    unsafe { Library::new(path) }
}

fn read_manifest(library: &Library, path: &Path) -> Result<UnitManifest> {
    // SAFETY: The symbol type matches the `declare_unit!` export.
    let entry: Symbol<UnitManifestFn> = unsafe { library.get(UNIT_MANIFEST_SYMBOL) }
        .with_context(|| format!("Missing unit manifest symbol in {}", path.display()))?;

    // SAFETY: The entry point only builds the registration table.
    let manifest = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe { entry() }))
        .map_err(crate::error::panic_to_error)
        .with_context(|| format!("Unit manifest of {} panicked", path.display()))?;

    if manifest.abi_version != UNIT_ABI_VERSION {
        bail!(
            "unit abi_version mismatch: unit={}, host={}",
            manifest.abi_version,
            UNIT_ABI_VERSION
        );
    }
    Ok(manifest)
}

impl UnitStorage for DylibStorage {
    fn locate(&self, name: &str) -> PathBuf {
        self.directory
            .join(format!("{name}.{}", std::env::consts::DLL_EXTENSION))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn open(&self, path: &Path) -> Result<UnitImage> {
        let declared = DependencyManifest::load_for(path)?;
        let resolver = DependencyResolver::new(path.parent().unwrap_or(&self.directory));

        let mut dependencies = Vec::with_capacity(declared.dependencies.len());
        for name in &declared.dependencies {
            let dep_path = resolver.resolve(name).ok_or_else(|| {
                anyhow!(
                    "dependency `{name}` of {} not found alongside the unit",
                    path.display()
                )
            })?;
            debug!("Loading dependency {} for {}", dep_path.display(), path.display());
            let library = open_isolated(&dep_path)
                .with_context(|| format!("Failed to load dependency {}", dep_path.display()))?;
            dependencies.push(library);
        }

        let shadow = self.shadow_copy(path)?;
        let opened = open_isolated(&shadow);
        // The mapping outlives the file where the platform allows removing it.
        if let Err(e) = fs::remove_file(&shadow) {
            debug!("Keeping shadow copy {}: {}", shadow.display(), e);
        }
        let unit =
            opened.with_context(|| format!("Failed to load unit library {}", path.display()))?;
        let manifest = read_manifest(&unit, path)?;

        Ok(UnitImage {
            source: path.to_path_buf(),
            manifest,
            library: Some(NativeLibrary {
                _unit: unit,
                _dependencies: dependencies,
            }),
        })
    }
}

type ManifestFactory = Arc<dyn Fn() -> Result<UnitManifest> + Send + Sync>;

/// Units compiled into the host process, registered by name.
///
/// Each `open` yields a fresh image, so reclamation behaves exactly like it
/// does for native units.
#[derive(Clone, Default)]
pub struct StaticStorage {
    units: Arc<RwLock<HashMap<String, ManifestFactory>>>,
}

const STATIC_ROOT: &str = "static";

impl StaticStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the unit `name`.
    pub fn insert<F>(&self, name: impl Into<String>, manifest: F)
    where
        F: Fn() -> UnitManifest + Send + Sync + 'static,
    {
        self.insert_fallible(name, move || Ok(manifest()));
    }

    /// Register a unit whose opening may fail, e.g. a malformed one.
    pub fn insert_fallible<F>(&self, name: impl Into<String>, manifest: F)
    where
        F: Fn() -> Result<UnitManifest> + Send + Sync + 'static,
    {
        self.units
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::new(manifest));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.units
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    fn factory(&self, path: &Path) -> Option<ManifestFactory> {
        let name = path.strip_prefix(STATIC_ROOT).ok()?.to_str()?;
        self.units
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(Arc::clone)
    }
}

impl UnitStorage for StaticStorage {
    fn locate(&self, name: &str) -> PathBuf {
        Path::new(STATIC_ROOT).join(name)
    }

    fn exists(&self, path: &Path) -> bool {
        self.factory(path).is_some()
    }

    fn open(&self, path: &Path) -> Result<UnitImage> {
        let factory = self
            .factory(path)
            .ok_or_else(|| anyhow!("static unit {} is not registered", path.display()))?;
        let manifest = factory()?;
        if manifest.abi_version != UNIT_ABI_VERSION {
            bail!(
                "unit abi_version mismatch: unit={}, host={}",
                manifest.abi_version,
                UNIT_ABI_VERSION
            );
        }
        Ok(UnitImage::from_manifest(path, manifest))
    }
}

impl std::fmt::Debug for StaticStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let units = self.units.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = units.keys().collect();
        names.sort();
        f.debug_struct("StaticStorage").field("units", &names).finish()
    }
}
