mod bootstrap;
mod demo_suite;
mod sim_host;
mod sim_loop;
mod world;

pub(crate) use bootstrap::build_sim;
pub(crate) use sim_loop::run;
