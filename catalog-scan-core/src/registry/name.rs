use std::{
    borrow::Borrow,
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

fn interner() -> &'static Mutex<HashSet<Arc<str>>> {
    static INTERNER: OnceLock<Mutex<HashSet<Arc<str>>>> = OnceLock::new();
    INTERNER.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Open, interned driver identity.
///
/// New drivers register by name; equal names share one allocation so clones
/// are pointer copies. Ordering is ordinal on the underlying string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverName(Arc<str>);

impl DriverName {
    pub fn new(name: &str) -> Self {
        let mut names =
            interner().lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = names.get(name) {
            return Self(Arc::clone(existing));
        }
        let interned: Arc<str> = Arc::from(name);
        names.insert(Arc::clone(&interned));
        Self(interned)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DriverName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for DriverName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DriverName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DriverName {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl AsRef<str> for DriverName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DriverName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for DriverName {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DriverName {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(&raw))
    }
}
