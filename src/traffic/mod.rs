pub mod enforcer;
