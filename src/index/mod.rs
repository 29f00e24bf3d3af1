pub mod b_plus_tree;
pub mod btree_iterator;
pub mod btree_page;
pub mod context;
pub mod key_comparator;
pub mod storable;

pub use b_plus_tree::{BPlusTree, TreeStats};
pub use btree_iterator::BTreeIterator;
pub use btree_page::{BTreeNode, InternalNode, LeafNode, NodeKind, Operation};
pub use context::Context;
pub use key_comparator::{BytewiseComparator, IntegerComparator, KeyComparator, OrdComparator};
pub use storable::{GenericKey, Storable};
