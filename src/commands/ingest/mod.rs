mod layout;
mod run;

pub use run::run;
