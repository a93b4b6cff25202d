//! Typed, named values that tasks export for other tasks to consume.
//!
//! A [`ProviderType`] is a token shared between the task that produces a value
//! and the tasks that consume it. Whether a consumer can see an export is
//! decided by the export's [`Visibility`], relative to where both tasks sit in
//! the generator tree.

use std::any::{TypeId, type_name};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::core::ArcStr;

/// A named visibility boundary opened by a generator.
///
/// Tasks can export a provider to a scope, which makes it visible to every
/// task inside the subtree of the nearest generator that opens that scope.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    name: ArcStr,
}

impl Scope {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({})", self.name)
    }
}

/// Who may consume an exported provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// The exporting generator and its descendants.
    Instance,
    /// The subtree of the nearest enclosing generator that opens the scope.
    Scope(Scope),
    /// Every task in the project.
    Project,
}

/// Identity of a provider: its name plus the Rust type of its value.
#[derive(Clone)]
pub(crate) struct ProviderKey {
    pub(crate) name: ArcStr,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
}

impl fmt::Debug for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<{}>", self.name, self.type_name)
    }
}

/// A typed provider token.
///
/// ```rust
/// use kumiki::ProviderType;
///
/// #[derive(Clone)]
/// struct Paths { src: String }
///
/// let paths: ProviderType<Paths> = ProviderType::new("paths");
/// let export = paths.export();
/// let dependency = paths.dependency();
/// # let _ = (export, dependency);
/// ```
pub struct ProviderType<T> {
    name: ArcStr,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for ProviderType<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ProviderType<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderType({}: {})", self.name, type_name::<T>())
    }
}

impl<T> ProviderType<T>
where
    T: Send + Sync + 'static,
{
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            _phantom: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn key(&self) -> ProviderKey {
        ProviderKey {
            name: self.name.clone(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// Export visible to the exporting generator and its descendants.
    pub fn export(&self) -> Export {
        Export {
            provider: self.key(),
            visibility: Visibility::Instance,
        }
    }

    /// Export visible inside the nearest enclosing generator opening `scope`.
    pub fn export_to(&self, scope: &Scope) -> Export {
        Export {
            provider: self.key(),
            visibility: Visibility::Scope(scope.clone()),
        }
    }

    /// Export visible to every task in the project.
    pub fn export_project(&self) -> Export {
        Export {
            provider: self.key(),
            visibility: Visibility::Project,
        }
    }

    /// A required dependency on this provider.
    pub fn dependency(&self) -> Dependency {
        Dependency {
            provider: self.key(),
            scope: None,
            optional: false,
        }
    }
}

/// A provider a task promises to produce, with its visibility.
#[derive(Debug, Clone)]
pub struct Export {
    pub(crate) provider: ProviderKey,
    pub(crate) visibility: Visibility,
}

impl Export {
    pub fn name(&self) -> &str {
        &self.provider.name
    }

    pub fn visibility(&self) -> &Visibility {
        &self.visibility
    }
}

/// A request for a provider, resolved to exactly one producing task.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub(crate) provider: ProviderKey,
    pub(crate) scope: Option<Scope>,
    pub(crate) optional: bool,
}

impl Dependency {
    pub fn name(&self) -> &str {
        &self.provider.name
    }

    /// Resolve to nothing instead of failing when no producer is in reach.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Only consider exports made to `scope`.
    pub fn in_scope(mut self, scope: &Scope) -> Self {
        self.scope = Some(scope.clone());
        self
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }
}
