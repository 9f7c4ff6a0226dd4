use crate::module::Module;

/// Version of the manifest layout shared between host and units.
pub const UNIT_ABI_VERSION: u32 = 1;

/// Symbol every native unit exports (see [`declare_unit!`](crate::declare_unit)).
pub const UNIT_MANIFEST_SYMBOL: &[u8] = b"_cogworks_unit_manifest\0";

/// Signature of the manifest entry point.
pub type UnitManifestFn = unsafe fn() -> UnitManifest;

/// No-argument constructor for a module type.
pub type ModuleConstructor = fn() -> Box<dyn Module>;

/// One entry of a unit's compile-time registration table.
#[derive(Debug, Clone, Copy)]
pub struct ModuleDescriptor {
    pub type_name: &'static str,
    pub is_abstract: bool,
    pub constructor: Option<ModuleConstructor>,
}

fn construct<T>() -> Box<dyn Module>
where
    T: Module + Default,
{
    Box::new(T::default())
}

impl ModuleDescriptor {
    /// A concrete module type built through `Default`.
    #[must_use]
    pub fn concrete<T>() -> Self
    where
        T: Module + Default,
    {
        Self {
            type_name: short_type_name::<T>(),
            is_abstract: false,
            constructor: Some(construct::<T>),
        }
    }

    /// Same as [`concrete`](Self::concrete) with an explicit display name.
    #[must_use]
    pub fn named<T>(type_name: &'static str) -> Self
    where
        T: Module + Default,
    {
        Self {
            type_name,
            ..Self::concrete::<T>()
        }
    }

    /// A base type that only exists to be extended. Never instantiated.
    #[must_use]
    pub const fn abstract_type(type_name: &'static str) -> Self {
        Self {
            type_name,
            is_abstract: true,
            constructor: None,
        }
    }

    /// A concrete type lacking a no-argument constructor. Never instantiated.
    #[must_use]
    pub const fn without_constructor(type_name: &'static str) -> Self {
        Self {
            type_name,
            is_abstract: false,
            constructor: None,
        }
    }

    /// Constructor of a module candidate: concrete and no-argument constructible.
    #[must_use]
    pub fn candidate(&self) -> Option<ModuleConstructor> {
        if self.is_abstract {
            return None;
        }
        self.constructor
    }
}

/// Registration table exported by a compiled unit.
#[derive(Debug, Clone)]
pub struct UnitManifest {
    pub abi_version: u32,
    pub modules: Vec<ModuleDescriptor>,
}

impl UnitManifest {
    #[must_use]
    pub fn new(modules: Vec<ModuleDescriptor>) -> Self {
        Self {
            abi_version: UNIT_ABI_VERSION,
            modules,
        }
    }

    #[must_use]
    pub fn candidate_count(&self) -> usize {
        self.modules.iter().filter(|d| d.candidate().is_some()).count()
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// Export the manifest entry point of a unit.
///
/// ```ignore
/// cogworks::declare_unit!(
///     ModuleDescriptor::concrete::<Greeter>(),
///     ModuleDescriptor::abstract_type("CommandModule"),
/// );
/// ```
#[macro_export]
macro_rules! declare_unit {
    ($($descriptor:expr),* $(,)?) => {
        #[no_mangle]
        pub fn _cogworks_unit_manifest() -> $crate::unit::UnitManifest {
            $crate::unit::UnitManifest::new(vec![$($descriptor),*])
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleBase;

    #[derive(Default)]
    struct Greeter {
        base: ModuleBase,
    }

    impl Module for Greeter {
        fn base(&self) -> &ModuleBase {
            &self.base
        }
    }

    #[test]
    fn test_candidate_rules() {
        let concrete = ModuleDescriptor::concrete::<Greeter>();
        assert_eq!(concrete.type_name, "Greeter");
        assert!(concrete.candidate().is_some());

        assert!(ModuleDescriptor::abstract_type("Base").candidate().is_none());
        assert!(ModuleDescriptor::without_constructor("NeedsArgs")
            .candidate()
            .is_none());
    }

    #[test]
    fn test_abstract_with_constructor_is_not_candidate() {
        let mut descriptor = ModuleDescriptor::concrete::<Greeter>();
        descriptor.is_abstract = true;
        assert!(descriptor.candidate().is_none());
    }

    #[test]
    fn test_manifest_counts_candidates() {
        let manifest = UnitManifest::new(vec![
            ModuleDescriptor::abstract_type("Base"),
            ModuleDescriptor::concrete::<Greeter>(),
            ModuleDescriptor::named::<Greeter>("Other"),
        ]);
        assert_eq!(manifest.abi_version, UNIT_ABI_VERSION);
        assert_eq!(manifest.candidate_count(), 2);
    }

    #[test]
    fn test_constructed_module_is_fresh() {
        let ctor = ModuleDescriptor::concrete::<Greeter>().candidate().unwrap();
        let module = ctor();
        assert!(module.base().registry().is_none());
    }
}
