pub mod block;
pub mod blocked;
pub mod dense;
pub mod sparse;
pub mod symbolic;

pub use block::{Block, BlockSparse, Storage};
pub use blocked::RawBlocks;
pub use sparse::TripletBuilder;
pub use symbolic::{BlockReport, FillInPlan, FillInReport, TermShape};
