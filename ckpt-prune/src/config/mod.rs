pub mod prune_config;
