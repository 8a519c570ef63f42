use ahash::AHashMap;

/// Mints names unique within one module. Each base name keeps a counter of
/// the suffixes already handed out for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameTable {
    counters: AHashMap<String, u32>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table in which every name in `taken` is already in use.
    pub fn seeded<I, S>(taken: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new();
        table.reserve(taken);
        table
    }

    pub fn reserve<I, S>(&mut self, taken: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in taken {
            self.counters.insert(name.into(), 1);
        }
    }

    /// Replaces `.` with `_`, then appends `_<n>` until the name is unused.
    pub fn unique_name(&mut self, name: &str) -> String {
        let mut name = name.replace('.', "_");
        loop {
            match self.counters.get_mut(&name) {
                None => {
                    self.counters.insert(name.clone(), 1);
                    return name;
                }
                Some(counter) => {
                    let suffixed = format!("{name}_{counter}");
                    *counter += 1;
                    name = suffixed;
                }
            }
        }
    }
}

/// Qualifies `name` with the module it is generated for.
pub fn mangle_name(module_name: &str, name: &str) -> String {
    if module_name.is_empty() {
        name.to_string()
    } else {
        format!("{module_name}_{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_names_get_increasing_suffixes() {
        let mut table = NameTable::new();
        assert_eq!(table.unique_name("fused_add"), "fused_add");
        assert_eq!(table.unique_name("fused_add"), "fused_add_1");
        assert_eq!(table.unique_name("fused_add"), "fused_add_2");
    }

    #[test]
    fn dots_become_underscores() {
        let mut table = NameTable::new();
        assert_eq!(table.unique_name("fused_nn.conv2d"), "fused_nn_conv2d");
    }

    #[test]
    fn seeded_names_are_never_reissued() {
        let mut table = NameTable::seeded(["main", "default_fused_add"]);
        assert_eq!(table.unique_name("main"), "main_1");
        assert_eq!(table.unique_name("default_fused_add"), "default_fused_add_1");
    }

    #[test]
    fn suffixed_name_collisions_are_skipped() {
        let mut table = NameTable::seeded(["f_1"]);
        assert_eq!(table.unique_name("f"), "f");
        assert_eq!(table.unique_name("f"), "f_1_1");
    }

    #[test]
    fn mangling_prefixes_module_name() {
        assert_eq!(mangle_name("default", "fused_add"), "default_fused_add");
        assert_eq!(mangle_name("", "fused_add"), "fused_add");
    }
}
