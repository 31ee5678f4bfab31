pub mod enums;
pub mod filters;
pub mod order;
pub mod patient;
pub mod result_set;
pub mod test_definition;

pub use filters::*;
pub use order::*;
pub use patient::*;
pub use result_set::*;
pub use test_definition::*;
