use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use market_core::Symbol;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::websocket::FeedHandle;

/// Reference-counted upstream subscriptions shared by all client sessions.
///
/// The first lease on a symbol subscribes it upstream; dropping the last
/// lease unsubscribes it. Pinned symbols stay subscribed for the life of the
/// hub regardless of leases.
pub struct FeedHub {
    handle: FeedHandle,
    refs: DashMap<Symbol, usize>,
    pinned: BTreeSet<Symbol>,
}

impl FeedHub {
    pub fn new(handle: FeedHandle, pinned: BTreeSet<Symbol>) -> Arc<Self> {
        for symbol in &pinned {
            handle.subscribe(symbol.clone());
        }
        Arc::new(Self {
            handle,
            refs: DashMap::new(),
            pinned,
        })
    }

    pub fn acquire(self: &Arc<Self>, symbols: impl IntoIterator<Item = Symbol>) -> SymbolLease {
        let symbols: BTreeSet<Symbol> = symbols.into_iter().collect();
        for symbol in &symbols {
            let mut count = self.refs.entry(symbol.clone()).or_insert(0);
            *count += 1;
            if *count == 1 && !self.pinned.contains(symbol) {
                tracing::debug!("Subscribing upstream to {}", symbol);
                self.handle.subscribe(symbol.clone());
            }
        }
        SymbolLease {
            hub: Arc::clone(self),
            symbols,
        }
    }

    fn release(&self, symbols: &BTreeSet<Symbol>) {
        for symbol in symbols {
            if let Entry::Occupied(mut entry) = self.refs.entry(symbol.clone()) {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                    if !self.pinned.contains(symbol) {
                        tracing::debug!("No sessions left for {}, unsubscribing upstream", symbol);
                        self.handle.unsubscribe(symbol);
                    }
                }
            }
        }
    }

    /// Number of live leases on `symbol`.
    pub fn lease_count(&self, symbol: &Symbol) -> usize {
        self.refs.get(symbol).map(|c| *c).unwrap_or(0)
    }

    /// Symbols currently subscribed upstream.
    pub fn upstream_symbols(&self) -> BTreeSet<Symbol> {
        self.handle.symbols()
    }
}

/// Held by one client session for as long as it wants ticks for `symbols`.
pub struct SymbolLease {
    hub: Arc<FeedHub>,
    symbols: BTreeSet<Symbol>,
}

impl SymbolLease {
    pub fn symbols(&self) -> &BTreeSet<Symbol> {
        &self.symbols
    }

    pub fn contains(&self, symbol: &Symbol) -> bool {
        self.symbols.contains(symbol)
    }
}

impl Drop for SymbolLease {
    fn drop(&mut self) {
        self.hub.release(&self.symbols);
    }
}
