pub mod coverage;
pub mod diagnostics;
pub mod judges;
pub mod report;
