pub mod bagup;
pub mod project;
pub mod supervisor;
pub mod tally;
pub mod tally_session;
