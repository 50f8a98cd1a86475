//! tlfcr-storage: OpenDAL-backed block storage for folder trees

pub mod blocks;
pub mod health;
pub mod operator;
pub mod search;

pub use blocks::{BlockPutState, BlockStore};
pub use health::check_health;
pub use operator::build_operator;
pub use search::{search_for_paths, FoundPath};
