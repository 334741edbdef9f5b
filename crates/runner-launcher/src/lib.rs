// runner-launcher: Provisions, configures and supervises a fleet of self-hosted
// GitHub Actions runners. Depends on `launcher-sdk` and `launcher-common`.
//
// Architecture:
//   main → CommandSettings → Launcher::plan → Launcher::run
//   per runner: CredentialBroker → Provisioner → Configurator → ProcessSupervisor

pub mod command_settings;
pub mod configurator;
pub mod credential_broker;
pub mod fleet;
pub mod github_api;
pub mod process_supervisor;
pub mod provisioner;

#[cfg(all(test, unix))]
pub(crate) mod test_support;
