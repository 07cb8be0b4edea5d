// compress/src/lib.rs

pub mod chunker;
pub mod packer;
pub mod sorter;
pub mod tree;

pub use packer::{compress_dir, compress_dir_with};
pub use tree::{TreeStats, TreeStream};
