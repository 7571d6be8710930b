// Library root for the turnpick binary: configuration, the league REST client
// and the console front end.

pub mod api;
pub mod config;
pub mod console;
