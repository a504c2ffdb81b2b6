use crate::indices::ModuleId;
use crate::Error;
use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;
use hashbrown::HashMap;
use smallvec::SmallVec;
use spin::RwLock;

/// Library NID matching any library of a module.
pub const ANY_LIBRARY: u32 = 0xFFFF_FFFF;

/// Names a loaded module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleRef {
    /// The main module of the running application.
    Main,
    Named(String),
}

impl From<&str> for ModuleRef {
    fn from(name: &str) -> Self {
        Self::Named(name.into())
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleRef::Main => f.write_str("<main>"),
            ModuleRef::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    pub vaddr: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub id: ModuleId,
    pub name: Arc<str>,
    pub module_nid: u32,
    pub segments: SmallVec<[SegmentInfo; 4]>,
}

/// Answers address questions about loaded modules. Implemented by the module
/// loader.
pub trait ModuleResolver: Send + Sync {
    /// Entry address of a function `module` exports. Bit 0 marks Thumb code.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidModule`] if the module isn't loaded,
    /// [`Error::InvalidTarget`] if it doesn't export the function.
    fn resolve_export(
        &self,
        module: &ModuleRef,
        library_nid: u32,
        function_nid: u32,
    ) -> crate::Result<u32>;

    /// Address of the stub through which `module` calls an imported function.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidModule`] if the module isn't loaded,
    /// [`Error::InvalidTarget`] if it doesn't import the function.
    fn resolve_import(
        &self,
        module: &ModuleRef,
        library_nid: u32,
        function_nid: u32,
    ) -> crate::Result<u32>;

    /// Guest address of `offset` bytes into segment `segment`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidModule`] if the module isn't loaded,
    /// [`Error::InvalidSegment`] if the segment or offset is out of range.
    fn resolve_offset(&self, module: ModuleId, segment: u32, offset: u32) -> crate::Result<u32>;

    /// # Errors
    ///
    /// [`Error::InvalidModule`] if the module isn't loaded.
    fn module_info(&self, module: &ModuleRef) -> crate::Result<ModuleInfo>;
}

/// An in-process [`ModuleResolver`] the loader fills as modules come and go.
#[derive(Debug, Default)]
pub struct ModuleTable {
    inner: RwLock<Modules>,
}

#[derive(Debug, Default)]
struct Modules {
    by_name: HashMap<Arc<str>, ModuleId>,
    modules: HashMap<ModuleId, ModuleInfo>,
    main: Option<ModuleId>,
    exports: HashMap<SymbolKey, u32>,
    imports: HashMap<SymbolKey, u32>,
}

#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
struct SymbolKey {
    module: ModuleId,
    library_nid: u32,
    function_nid: u32,
}

impl Modules {
    fn module_id(&self, module: &ModuleRef) -> crate::Result<ModuleId> {
        match module {
            ModuleRef::Main => self.main,
            ModuleRef::Named(name) => self.by_name.get(name.as_str()).copied(),
        }
        .ok_or(Error::InvalidModule)
    }

    fn symbol(
        &self,
        table: &HashMap<SymbolKey, u32>,
        module: &ModuleRef,
        library_nid: u32,
        function_nid: u32,
    ) -> crate::Result<u32> {
        let module = self.module_id(module)?;

        let found = if library_nid == ANY_LIBRARY {
            // lowest library NID first, whatever order the map iterates in
            table
                .iter()
                .filter(|(key, _)| key.module == module && key.function_nid == function_nid)
                .min_by_key(|(key, _)| key.library_nid)
                .map(|(_, address)| *address)
        } else {
            table
                .get(&SymbolKey {
                    module,
                    library_nid,
                    function_nid,
                })
                .copied()
        };

        found.ok_or(Error::InvalidTarget)
    }
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a loaded module. Defining an id again replaces the old
    /// definition and drops its symbols.
    pub fn define_module(
        &self,
        id: ModuleId,
        name: &str,
        module_nid: u32,
        segments: &[SegmentInfo],
    ) -> &Self {
        let mut inner = self.inner.write();
        if inner.modules.contains_key(&id) {
            tracing::warn!("module {id:?} defined twice, replacing `{name}`");
            unload(&mut inner, id);
        }

        let name: Arc<str> = name.into();
        inner.by_name.insert(name.clone(), id);
        inner.modules.insert(
            id,
            ModuleInfo {
                id,
                name,
                module_nid,
                segments: segments.iter().copied().collect(),
            },
        );
        self
    }

    pub fn set_main_module(&self, id: ModuleId) -> &Self {
        self.inner.write().main = Some(id);
        self
    }

    pub fn define_export(
        &self,
        module: ModuleId,
        library_nid: u32,
        function_nid: u32,
        address: u32,
    ) -> &Self {
        self.inner.write().exports.insert(
            SymbolKey {
                module,
                library_nid,
                function_nid,
            },
            address,
        );
        self
    }

    pub fn define_import(
        &self,
        module: ModuleId,
        library_nid: u32,
        function_nid: u32,
        stub: u32,
    ) -> &Self {
        self.inner.write().imports.insert(
            SymbolKey {
                module,
                library_nid,
                function_nid,
            },
            stub,
        );
        self
    }

    /// Forgets a module and everything it exported or imported.
    pub fn unload_module(&self, id: ModuleId) {
        unload(&mut self.inner.write(), id);
    }
}

fn unload(modules: &mut Modules, id: ModuleId) {
    if let Some(info) = modules.modules.remove(&id) {
        if modules.by_name.get(&info.name) == Some(&id) {
            modules.by_name.remove(&info.name);
        }
    }
    if modules.main == Some(id) {
        modules.main = None;
    }
    modules.exports.retain(|key, _| key.module != id);
    modules.imports.retain(|key, _| key.module != id);
}

impl ModuleResolver for ModuleTable {
    fn resolve_export(
        &self,
        module: &ModuleRef,
        library_nid: u32,
        function_nid: u32,
    ) -> crate::Result<u32> {
        let inner = self.inner.read();
        inner.symbol(&inner.exports, module, library_nid, function_nid)
    }

    fn resolve_import(
        &self,
        module: &ModuleRef,
        library_nid: u32,
        function_nid: u32,
    ) -> crate::Result<u32> {
        let inner = self.inner.read();
        inner.symbol(&inner.imports, module, library_nid, function_nid)
    }

    fn resolve_offset(&self, module: ModuleId, segment: u32, offset: u32) -> crate::Result<u32> {
        let inner = self.inner.read();
        let info = inner.modules.get(&module).ok_or(Error::InvalidModule)?;

        let seg = usize::try_from(segment)
            .ok()
            .and_then(|index| info.segments.get(index))
            .ok_or(Error::InvalidSegment { segment })?;
        if offset >= seg.size {
            return Err(Error::InvalidSegment { segment });
        }

        seg.vaddr
            .checked_add(offset)
            .ok_or(Error::InvalidSegment { segment })
    }

    fn module_info(&self, module: &ModuleRef) -> crate::Result<ModuleInfo> {
        let inner = self.inner.read();
        let id = inner.module_id(module)?;
        inner.modules.get(&id).cloned().ok_or(Error::InvalidModule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_module() -> ModuleId {
        ModuleId::from_u32(1)
    }

    fn libc() -> ModuleId {
        ModuleId::from_u32(2)
    }

    fn table() -> ModuleTable {
        let table = ModuleTable::new();
        table
            .define_module(
                main_module(),
                "eboot",
                0xEE10_DD7A,
                &[SegmentInfo {
                    vaddr: 0x8100_0000,
                    size: 0x1000,
                }],
            )
            .define_module(libc(), "SceLibc", 0x1234, &[])
            .set_main_module(main_module())
            .define_export(libc(), 0xAAAA, 0x0001, 0x8200_0001)
            .define_import(main_module(), 0xAAAA, 0x0001, 0x8100_0100);
        table
    }

    #[test]
    fn exports_and_imports() {
        let table = table();
        assert_eq!(
            table.resolve_export(&"SceLibc".into(), 0xAAAA, 0x0001),
            Ok(0x8200_0001)
        );
        assert_eq!(
            table.resolve_export(&"SceLibc".into(), ANY_LIBRARY, 0x0001),
            Ok(0x8200_0001)
        );
        assert_eq!(
            table.resolve_import(&ModuleRef::Main, 0xAAAA, 0x0001),
            Ok(0x8100_0100)
        );
        assert_eq!(
            table.resolve_export(&"SceLibc".into(), 0xAAAA, 0x0002),
            Err(Error::InvalidTarget)
        );
        assert_eq!(
            table.resolve_export(&"SceGxm".into(), 0xAAAA, 0x0001),
            Err(Error::InvalidModule)
        );
    }

    #[test]
    fn any_library_prefers_the_lowest_library_nid() {
        let table = table();
        table
            .define_export(libc(), 0xCCCC, 0x0001, 0x8200_0101)
            .define_export(libc(), 0x0BBB, 0x0001, 0x8200_0201)
            .define_export(libc(), 0xFFFE, 0x0001, 0x8200_0301);

        assert_eq!(
            table.resolve_export(&"SceLibc".into(), ANY_LIBRARY, 0x0001),
            Ok(0x8200_0201)
        );
    }

    #[test]
    fn offsets() {
        let table = table();
        assert_eq!(table.resolve_offset(main_module(), 0, 0x10), Ok(0x8100_0010));
        assert_eq!(
            table.resolve_offset(main_module(), 1, 0x10),
            Err(Error::InvalidSegment { segment: 1 })
        );
        assert_eq!(
            table.resolve_offset(main_module(), 0, 0x1000),
            Err(Error::InvalidSegment { segment: 0 })
        );
        assert_eq!(
            table.resolve_offset(ModuleId::from_u32(9), 0, 0),
            Err(Error::InvalidModule)
        );
    }

    #[test]
    fn unload_forgets_symbols() {
        let table = table();
        table.unload_module(libc());
        assert_eq!(
            table.resolve_export(&"SceLibc".into(), 0xAAAA, 0x0001),
            Err(Error::InvalidModule)
        );
        assert_eq!(table.module_info(&ModuleRef::Main).unwrap().name.as_ref(), "eboot");
    }
}
