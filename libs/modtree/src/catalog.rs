//! Static registration table: `(kind, name) -> constructor`.
//!
//! Discovery on disk only says *where* a unit lives and which registered type it
//! wants; the type itself must be registered here, either explicitly through a
//! [`CatalogBuilder`] or at link time through [`Registrator`].

use indexmap::IndexMap;
use std::sync::Arc;

use crate::contracts::{Interface, Module};
use crate::error::CatalogError;
use crate::kind::ModuleKind;

type Constructor = Arc<dyn Fn() -> Arc<dyn Module> + Send + Sync>;

/// A freshly constructed module with the object it hands to dependants.
pub struct Constructed {
    pub module: Arc<dyn Module>,
    pub interface: Interface,
}

impl Constructed {
    pub fn new(module: Arc<dyn Module>) -> Self {
        // Without a declared Interface dependants get the `Arc<dyn Module>` itself.
        let interface = module
            .interface()
            .unwrap_or_else(|| Arc::new(module.clone()) as Interface);
        Self { module, interface }
    }
}

/// Link-time registration hook collected by [`Catalog::discover`].
///
/// ```rust,ignore
/// inventory::submit! {
///     modtree::Registrator(|b| { b.register::<Mailer>(ModuleKind::Service); })
/// }
/// ```
pub struct Registrator(pub fn(&mut CatalogBuilder));

inventory::collect!(Registrator);

#[derive(Default)]
pub struct CatalogBuilder {
    entries: IndexMap<(ModuleKind, String), Constructor>,
    errors: Vec<String>,
}

impl CatalogBuilder {
    /// Register `M` under its short type name.
    pub fn register<M>(&mut self, kind: ModuleKind) -> &mut Self
    where
        M: Module + Default,
    {
        self.register_named(kind, short_type_name::<M>(), || {
            Arc::new(M::default()) as Arc<dyn Module>
        })
    }

    pub fn register_named<F>(&mut self, kind: ModuleKind, name: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn() -> Arc<dyn Module> + Send + Sync + 'static,
    {
        let name = name.into();
        let key = (kind, name);
        if self.entries.contains_key(&key) {
            self.errors
                .push(format!("{} '{}' is already registered", key.0, key.1));
            return self;
        }
        self.entries.insert(key, Arc::new(ctor));
        self
    }

    pub fn build(self) -> Result<Catalog, CatalogError> {
        if !self.errors.is_empty() {
            return Err(CatalogError::InvalidCatalogConfiguration {
                errors: self.errors,
            });
        }
        Ok(Catalog {
            entries: self.entries,
        })
    }
}

pub struct Catalog {
    entries: IndexMap<(ModuleKind, String), Constructor>,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self
            .entries
            .keys()
            .map(|(k, n)| format!("{k}:{n}"))
            .collect();
        f.debug_struct("Catalog").field("entries", &keys).finish()
    }
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Everything submitted through `inventory`.
    pub fn discover() -> Result<Self, CatalogError> {
        Self::discover_with(|_| {})
    }

    /// Everything submitted through `inventory`, plus what `extra` registers.
    pub fn discover_with(extra: impl FnOnce(&mut CatalogBuilder)) -> Result<Self, CatalogError> {
        let mut b = CatalogBuilder::default();
        for r in ::inventory::iter::<Registrator> {
            r.0(&mut b);
        }
        extra(&mut b);
        b.build()
    }

    pub fn contains(&self, kind: ModuleKind, name: &str) -> bool {
        self.entries.contains_key(&(kind, name.to_string()))
    }

    pub fn names(&self, kind: ModuleKind) -> Vec<&str> {
        self.entries
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, n)| n.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn construct(&self, kind: ModuleKind, name: &str) -> Option<Constructed> {
        let ctor = self.entries.get(&(kind, name.to_string()))?;
        Some(Constructed::new(ctor()))
    }
}

/// `my_crate::mail::Mailer<T>` -> `Mailer`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
