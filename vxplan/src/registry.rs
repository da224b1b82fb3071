//! Variant registry: per-family tables mapping signature keys to kernel
//! variants.
//!
//! Families are generated declaratively with [`FamilyBuilder`]: each key
//! field gets a domain, the cartesian product is walked, excluded
//! combinations are skipped and a generator closure describes the kernel for
//! every remaining combination. Registration is collected across crates with
//! `inventory`:
//!
//! ```ignore
//! inventory::submit! { FamilyRegistration::new("clip", clip_family) }
//! ```
//!
//! A built registry is immutable; lookups take `&self` and need no locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::classify::{FoldingTable, TypeClass};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::key::{FieldKind, KeyLayout, PackError, SignatureKey};
use crate::planner::{ConstantsFn, Geometry};
use crate::schema::ParameterSchema;

/// Families with more variants than this get a hashed index by default
pub const DEFAULT_HASHED_LOOKUP_THRESHOLD: usize = 32;

/// Names of the kernel body in its portable and precompiled forms.
///
/// Never interpreted here; handed to the kernel loading collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSource {
    /// Portable sources, helpers first, the kernel's own source last
    pub code: Vec<String>,
    /// Precompiled binaries
    pub executable: Vec<String>,
}

impl KernelSource {
    /// A kernel compiled from one portable source, also shipped precompiled
    /// under the same name
    #[must_use]
    pub fn code(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            code: vec![name.clone()],
            executable: vec![name],
        }
    }

    /// Prepend a helper source needed to compile the portable form
    #[must_use]
    pub fn with_helper(mut self, helper: impl Into<String>) -> Self {
        self.code.insert(0, helper.into());
        self
    }
}

/// Classes and flags a variant was registered under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub classes: Vec<TypeClass>,
    pub flags: Vec<u32>,
}

/// Kernel description produced by a family generator, before a key is
/// assigned
#[derive(Debug, Clone)]
pub struct VariantSpec {
    pub kernel_name: String,
    pub source: KernelSource,
    pub schema: ParameterSchema,
    pub geometry: Geometry,
    pub constants: Option<ConstantsFn>,
}

impl VariantSpec {
    #[must_use]
    pub fn new(
        kernel_name: impl Into<String>,
        source: KernelSource,
        schema: ParameterSchema,
        geometry: Geometry,
    ) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            source,
            schema,
            geometry,
            constants: None,
        }
    }

    #[must_use]
    pub fn with_constants(mut self, constants: ConstantsFn) -> Self {
        self.constants = Some(constants);
        self
    }
}

/// One registered kernel variant. Immutable once registered.
#[derive(Debug, Clone)]
pub struct VariantDescriptor {
    pub key: SignatureKey,
    pub signature: Signature,
    pub kernel_name: String,
    pub source: KernelSource,
    pub schema: ParameterSchema,
    pub geometry: Geometry,
    pub constants: Option<ConstantsFn>,
}

impl VariantDescriptor {
    /// Descriptor with an empty signature, for hand-built tables
    #[must_use]
    pub fn new(
        key: SignatureKey,
        kernel_name: impl Into<String>,
        source: KernelSource,
        schema: ParameterSchema,
        geometry: Geometry,
    ) -> Self {
        Self::from_spec(
            key,
            Signature {
                classes: Vec::new(),
                flags: Vec::new(),
            },
            VariantSpec::new(kernel_name, source, schema, geometry),
        )
    }

    #[must_use]
    pub fn from_spec(key: SignatureKey, signature: Signature, spec: VariantSpec) -> Self {
        Self {
            key,
            signature,
            kernel_name: spec.kernel_name,
            source: spec.source,
            schema: spec.schema,
            geometry: spec.geometry,
            constants: spec.constants,
        }
    }
}

/// One point of a family's domain: a class per class field and a value per
/// flag field.
#[derive(Debug, Clone)]
pub struct Combo {
    fields: Vec<(&'static str, FieldKind, u32)>,
}

impl Combo {
    /// Class chosen for a class field, `Unsupported` if no such field
    #[must_use]
    pub fn class(&self, name: &str) -> TypeClass {
        self.fields
            .iter()
            .find(|(n, kind, _)| *n == name && *kind == FieldKind::Class)
            .and_then(|&(_, _, code)| class_from_code(code))
            .unwrap_or(TypeClass::Unsupported)
    }

    /// Value chosen for a flag field, 0 if no such field
    #[must_use]
    pub fn flag(&self, name: &str) -> u32 {
        self.fields
            .iter()
            .find(|(n, kind, _)| *n == name && *kind == FieldKind::Flag)
            .map_or(0, |&(_, _, v)| v)
    }

    fn signature(&self) -> Signature {
        let mut classes = Vec::new();
        let mut flags = Vec::new();
        for &(_, kind, value) in &self.fields {
            match kind {
                FieldKind::Class => {
                    classes.push(class_from_code(value).unwrap_or(TypeClass::Unsupported));
                }
                FieldKind::Flag => flags.push(value),
            }
        }
        Signature { classes, flags }
    }
}

fn class_from_code(code: u32) -> Option<TypeClass> {
    DType::ALL
        .into_iter()
        .map(TypeClass::from)
        .find(|c| c.code() == code)
}

type Exclusion = Box<dyn Fn(&Combo) -> bool>;
type Generator = Box<dyn Fn(&Combo) -> Option<VariantSpec>>;

/// Declarative family construction: domains per key field, an exclusion
/// list, and a generator describing each remaining combination.
pub struct FamilyBuilder {
    name: &'static str,
    layout: KeyLayout,
    folding: FoldingTable,
    domains: HashMap<&'static str, Vec<u32>>,
    exclusions: Vec<Exclusion>,
    generator: Option<Generator>,
    explicit: Vec<(Signature, VariantSpec)>,
}

impl FamilyBuilder {
    #[must_use]
    pub fn new(name: &'static str, layout: KeyLayout) -> Self {
        Self {
            name,
            layout,
            folding: FoldingTable::identity(),
            domains: HashMap::new(),
            exclusions: Vec::new(),
            generator: None,
            explicit: Vec::new(),
        }
    }

    #[must_use]
    pub fn folding(mut self, folding: FoldingTable) -> Self {
        self.folding = folding;
        self
    }

    /// Domain of a class field
    #[must_use]
    pub fn classes(mut self, field: &'static str, domain: &[TypeClass]) -> Self {
        self.domains
            .insert(field, domain.iter().map(|c| c.code()).collect());
        self
    }

    /// Domain of a flag field
    #[must_use]
    pub fn flags(mut self, field: &'static str, domain: impl IntoIterator<Item = u32>) -> Self {
        self.domains.insert(field, domain.into_iter().collect());
        self
    }

    /// Skip every combination matching `predicate`
    #[must_use]
    pub fn exclude(mut self, predicate: impl Fn(&Combo) -> bool + 'static) -> Self {
        self.exclusions.push(Box::new(predicate));
        self
    }

    /// Describe the kernel for each combination; `None` skips it
    #[must_use]
    pub fn variants(mut self, generator: impl Fn(&Combo) -> Option<VariantSpec> + 'static) -> Self {
        self.generator = Some(Box::new(generator));
        self
    }

    /// Register one irregular variant explicitly
    #[must_use]
    pub fn variant(mut self, classes: &[TypeClass], flags: &[u32], spec: VariantSpec) -> Self {
        self.explicit.push((
            Signature {
                classes: classes.to_vec(),
                flags: flags.to_vec(),
            },
            spec,
        ));
        self
    }

    /// Generate, key and check every variant.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if a field has no domain while a generator
    /// is set, if a generated value does not fit its field, or if the family
    /// fails its self-check (see [`Family::self_check`]).
    pub fn build(self) -> Result<Family> {
        let mut entries = Vec::new();
        if let Some(generator) = &self.generator {
            for combo in self.combos()? {
                if self.exclusions.iter().any(|ex| ex(&combo)) {
                    continue;
                }
                if let Some(spec) = generator(&combo) {
                    entries.push((combo.signature(), spec));
                }
            }
        }
        entries.extend(self.explicit);

        let mut variants = Vec::with_capacity(entries.len());
        for (signature, spec) in entries {
            let key = self
                .layout
                .pack(&signature.classes, &signature.flags)
                .map_err(|e| Error::internal(format!("{}/{}: {e}", self.name, spec.kernel_name)))?;
            variants.push(Arc::new(VariantDescriptor::from_spec(key, signature, spec)));
        }
        Family::new(self.name, self.layout, self.folding, variants)
    }

    fn combos(&self) -> Result<Vec<Combo>> {
        let mut combos = vec![Combo { fields: Vec::new() }];
        for field in self.layout.fields() {
            let domain = self.domains.get(field.name).ok_or_else(|| {
                Error::internal(format!("{}: key field `{}` has no domain", self.name, field.name))
            })?;
            combos = combos
                .into_iter()
                .flat_map(|combo| {
                    domain.iter().map(move |&value| {
                        let mut next = combo.clone();
                        next.fields.push((field.name, field.kind, value));
                        next
                    })
                })
                .collect();
        }
        Ok(combos)
    }
}

/// Variant table for one operator family
pub struct Family {
    name: &'static str,
    layout: KeyLayout,
    folding: FoldingTable,
    variants: Vec<Arc<VariantDescriptor>>,
    index: Option<FxHashMap<SignatureKey, usize>>,
}

impl fmt::Debug for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Family")
            .field("name", &self.name)
            .field("variants", &self.variants.len())
            .field("hashed", &self.index.is_some())
            .finish_non_exhaustive()
    }
}

impl Family {
    /// Build a family from ready descriptors and run its self-check.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the self-check fails
    pub fn new(
        name: &'static str,
        layout: KeyLayout,
        folding: FoldingTable,
        variants: Vec<Arc<VariantDescriptor>>,
    ) -> Result<Self> {
        let mut family = Self {
            name,
            layout,
            folding,
            variants,
            index: None,
        };
        family.set_lookup_threshold(DEFAULT_HASHED_LOOKUP_THRESHOLD);
        family.self_check()?;
        Ok(family)
    }

    /// Switch to hashed lookup when the family has more than `threshold`
    /// variants, linear scan otherwise
    pub fn set_lookup_threshold(&mut self, threshold: usize) {
        self.index = (self.variants.len() > threshold).then(|| {
            self.variants
                .iter()
                .enumerate()
                .map(|(i, v)| (v.key, i))
                .collect()
        });
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    #[must_use]
    pub fn folding(&self) -> &FoldingTable {
        &self.folding
    }

    #[must_use]
    pub fn variants(&self) -> &[Arc<VariantDescriptor>] {
        &self.variants
    }

    #[must_use]
    pub fn is_hashed(&self) -> bool {
        self.index.is_some()
    }

    /// Find the variant registered under `key`. `None` is the ordinary
    /// not-found outcome.
    #[must_use]
    pub fn lookup(&self, key: SignatureKey) -> Option<Arc<VariantDescriptor>> {
        let found = match &self.index {
            Some(index) => index.get(&key).map(|&i| &self.variants[i]),
            None => self.variants.iter().find(|v| v.key == key),
        };
        found.cloned()
    }

    /// Classify concrete dtypes with this family's folding table and pack
    /// them with `flags`. A flag too wide for its field yields `None`: no
    /// registered variant can match it.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] if the number of dtypes or flags does not
    /// match the family's key layout
    pub fn key_for(&self, dtypes: &[DType], flags: &[u32]) -> Result<Option<SignatureKey>> {
        let classes: Vec<TypeClass> = dtypes.iter().map(|&d| self.folding.classify(d)).collect();
        match self.layout.pack(&classes, flags) {
            Ok(key) => Ok(Some(key)),
            Err(PackError::Overflow { field, value }) => {
                log::debug!("{}: flag `{field}` = {value} out of range", self.name);
                Ok(None)
            }
            Err(e) => Err(Error::internal(format!("{}: {e}", self.name))),
        }
    }

    /// `key_for` followed by `lookup`
    ///
    /// # Errors
    /// See [`Family::key_for`]
    pub fn select(&self, dtypes: &[DType], flags: &[u32]) -> Result<Option<Arc<VariantDescriptor>>> {
        Ok(self.key_for(dtypes, flags)?.and_then(|key| self.lookup(key)))
    }

    /// Registration-time checks:
    ///
    /// - keys are pairwise distinct
    /// - every schema is well formed
    /// - every registered class has a concrete dtype that classifies to it
    /// - looking up the key of that dtype returns exactly the variant
    ///
    /// # Errors
    /// Returns [`Error::Internal`] describing the first failure
    pub fn self_check(&self) -> Result<()> {
        let mut seen: FxHashMap<SignatureKey, &str> = FxHashMap::default();
        for v in &self.variants {
            if let Some(other) = seen.insert(v.key, &v.kernel_name) {
                return Err(Error::internal(format!(
                    "{}: key {} collides between `{other}` and `{}`",
                    self.name, v.key, v.kernel_name
                )));
            }
            if !v.schema.is_well_formed() {
                return Err(Error::internal(format!(
                    "{}: malformed parameter schema for `{}`",
                    self.name, v.kernel_name
                )));
            }
        }
        for v in &self.variants {
            if v.signature.classes.is_empty() && v.signature.flags.is_empty() {
                continue;
            }
            let dtypes = v
                .signature
                .classes
                .iter()
                .map(|&c| self.folding.representative(c))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    Error::internal(format!(
                        "{}: `{}` is registered for a class no dtype folds to",
                        self.name, v.kernel_name
                    ))
                })?;
            let found = self.select(&dtypes, &v.signature.flags)?;
            if !found.is_some_and(|f| Arc::ptr_eq(&f, v)) {
                return Err(Error::internal(format!(
                    "{}: `{}` is not reachable from its own signature",
                    self.name, v.kernel_name
                )));
            }
        }
        Ok(())
    }
}

/// A deferred family constructor collected across crates at link time
pub struct FamilyRegistration {
    pub name: &'static str,
    pub build: fn() -> Result<Family>,
}

impl FamilyRegistration {
    #[must_use]
    pub const fn new(name: &'static str, build: fn() -> Result<Family>) -> Self {
        Self { name, build }
    }
}

inventory::collect!(FamilyRegistration);

/// All variant families, keyed by family name
#[derive(Debug, Default)]
pub struct VariantRegistry {
    families: HashMap<&'static str, Family>,
}

impl VariantRegistry {
    /// Build from explicit families.
    ///
    /// # Errors
    /// Returns [`Error::Internal`] on duplicate family names
    pub fn from_families(families: impl IntoIterator<Item = Family>) -> Result<Self> {
        let mut map = HashMap::new();
        for family in families {
            let name = family.name;
            if map.insert(name, family).is_some() {
                return Err(Error::internal(format!("family `{name}` registered twice")));
            }
        }
        Ok(Self { families: map })
    }

    /// Build every family submitted with `inventory::submit!`.
    ///
    /// # Errors
    /// Returns the first family construction or self-check failure, or
    /// [`Error::Internal`] on duplicate family names
    pub fn from_inventory(hashed_lookup_threshold: usize) -> Result<Self> {
        let mut families = Vec::new();
        for entry in inventory::iter::<FamilyRegistration> {
            let mut family = (entry.build)()?;
            if family.name != entry.name {
                return Err(Error::internal(format!(
                    "family registered as `{}` builds `{}`",
                    entry.name, family.name
                )));
            }
            family.set_lookup_threshold(hashed_lookup_threshold);
            families.push(family);
        }
        let registry = Self::from_families(families)?;
        log::info!(
            "variant registry: {} families, {} variants",
            registry.families.len(),
            registry.variant_count()
        );
        Ok(registry)
    }

    #[must_use]
    pub fn family(&self, name: &str) -> Option<&Family> {
        self.families.get(name)
    }

    /// Families sorted by name
    #[must_use]
    pub fn families(&self) -> Vec<&Family> {
        let mut families: Vec<&Family> = self.families.values().collect();
        families.sort_by_key(|f| f.name);
        families
    }

    #[must_use]
    pub fn variant_count(&self) -> usize {
        self.families.values().map(|f| f.variants.len()).sum()
    }

    /// Look up `key` in `family`. Unknown families are treated as empty.
    #[must_use]
    pub fn lookup(&self, family: &str, key: SignatureKey) -> Option<Arc<VariantDescriptor>> {
        self.families.get(family).and_then(|f| f.lookup(key))
    }

    /// Re-run every family's self-check.
    ///
    /// # Errors
    /// Returns the first failure
    pub fn self_check(&self) -> Result<()> {
        self.families().into_iter().try_for_each(Family::self_check)
    }
}
