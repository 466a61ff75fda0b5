use super::wire::{BindValue, Scope};

/// Opaque identity of one backend transaction span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TrxToken(pub u64);

/// Client-side fetch bookkeeping for one select.
#[derive(Clone, Debug)]
pub struct Cursor {
    /// Server cursor name; `None` when the backend keeps no cursor.
    pub name: Option<String>,
    /// Rows delivered so far.
    pub pos: usize,
    /// Fetch size.
    pub rows: usize,
    pub eof: bool,
    pub trx: TrxToken,
    pub stmt: String,
    pub bindvalues: Vec<BindValue>,
}

impl Cursor {
    pub fn new(stmt: String, bindvalues: Vec<BindValue>, rows: usize, trx: TrxToken) -> Self {
        Self {
            name: None,
            pos: 0,
            rows,
            eof: false,
            trx,
            stmt,
            bindvalues,
        }
    }

    /// A server cursor can be continued only inside the transaction that
    /// opened it, and never in stateless scope.
    pub fn is_valid(&self, trx: TrxToken, scope: Scope) -> bool {
        scope != Scope::Stateless && self.name.is_some() && self.trx == trx
    }

    pub fn advance(&mut self, delivered: usize, more: bool) {
        self.pos += delivered;
        self.eof = !more;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_follows_token_and_scope() {
        let mut c = Cursor::new("select 1".into(), vec![], 10, TrxToken(3));
        assert!(!c.is_valid(TrxToken(3), Scope::Dedicated));
        c.name = Some("c1".into());
        assert!(c.is_valid(TrxToken(3), Scope::Dedicated));
        assert!(!c.is_valid(TrxToken(4), Scope::Dedicated));
        assert!(!c.is_valid(TrxToken(3), Scope::Stateless));
    }

    #[test]
    fn advance_tracks_eof() {
        let mut c = Cursor::new("select 1".into(), vec![], 2, TrxToken(1));
        c.advance(2, true);
        assert_eq!((c.pos, c.eof), (2, false));
        c.advance(1, false);
        assert_eq!((c.pos, c.eof), (3, true));
    }
}
