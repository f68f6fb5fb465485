pub mod cell_pool;
pub mod expression;
pub mod fraction;
pub mod reference;

// re-export for cleaner imports
pub use self::cell_pool::{CellPool, CellRecord};
pub use self::expression::{ExpressionScale, ExpressionTable};
pub use self::fraction::{FractionTable, FractionVector};
pub use self::reference::ReferenceCohort;
