// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// One entry of a caller-supplied symbol table: the start address of a
/// function and its display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub address: usize,
    pub function: String,
}

impl Symbol {
    pub fn new(address: usize, function: impl Into<String>) -> Self {
        Self {
            address,
            function: function.into(),
        }
    }
}

/// A symbol table mapping code addresses to function names, supplied by the
/// embedding application.
///
/// The table MUST be sorted ascending by address; [`SymbolTable::resolve`]
/// relies on it to return the tightest preceding symbol. Sortedness is
/// checked at initialization as a diagnostic only — the caller remains
/// responsible for providing a sorted table.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        Self { symbols }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Resolves `address` to the entry with the largest address not greater
    /// than it, or `None` when the table is empty or every entry lies above
    /// the address.
    ///
    /// Linear scan tracking the last entry at or below the target; with a
    /// sorted table this yields the tightest preceding symbol, which is what
    /// makes "function+offset" reporting possible.
    pub fn resolve(&self, address: usize) -> Option<&Symbol> {
        let mut last = None;
        for symbol in &self.symbols {
            if symbol.address > address {
                break;
            }
            last = Some(symbol);
        }
        last
    }

    /// Confirms addresses are non-decreasing. Returns the first inversion as
    /// an error; callers treat it as a diagnostic, not a rejection.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut last_address = 0usize;
        for (index, symbol) in self.symbols.iter().enumerate() {
            anyhow::ensure!(
                symbol.address >= last_address,
                "Symbol table is not sorted at index {index}: {:#x} follows {last_address:#x}",
                symbol.address,
            );
            last_address = symbol.address;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(addresses: &[usize]) -> SymbolTable {
        SymbolTable::new(
            addresses
                .iter()
                .map(|&a| Symbol::new(a, format!("fn_{a:x}")))
                .collect(),
        )
    }

    #[test]
    fn test_resolve_empty_table() {
        assert!(table(&[]).resolve(0x1000).is_none());
    }

    #[test]
    fn test_resolve_single_entry() {
        let t = table(&[0x1000]);
        assert!(t.resolve(0xfff).is_none());
        assert_eq!(t.resolve(0x1000).unwrap().address, 0x1000);
        assert_eq!(t.resolve(0xffff_ffff).unwrap().address, 0x1000);
    }

    #[test]
    fn test_resolve_tightest_preceding() {
        let t = table(&[0x1000, 0x2000, 0x3000]);
        // before the first entry
        assert!(t.resolve(0x0).is_none());
        // exactly on entries
        assert_eq!(t.resolve(0x1000).unwrap().address, 0x1000);
        assert_eq!(t.resolve(0x3000).unwrap().address, 0x3000);
        // between entries: the lower one wins
        assert_eq!(t.resolve(0x2fff).unwrap().address, 0x2000);
        // past the last entry
        assert_eq!(t.resolve(0x9000).unwrap().address, 0x3000);
    }

    #[test]
    fn test_validate_sorted() {
        assert!(table(&[]).validate().is_ok());
        assert!(table(&[0x1000]).validate().is_ok());
        assert!(table(&[0x1000, 0x1000, 0x2000]).validate().is_ok());
    }

    #[test]
    fn test_validate_inversion() {
        let err = table(&[0x1000, 0x3000, 0x2000]).validate().unwrap_err();
        assert!(err.to_string().contains("not sorted"));
    }
}
