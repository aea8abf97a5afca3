mod inode;
mod map;

pub use inode::{ChildEntry, Inode, InodeState, TreeChildren};
pub use map::{InodeMap, ShutdownHook};
