
use crate::engine::Item;

pub(crate) fn live(value: &[u8]) -> Item {
    Item {
        value: value.to_vec(),
        tombstone: false,
    }
}

pub(crate) fn tombstone() -> Item {
    Item {
        value: Vec::new(),
        tombstone: true,
    }
}
