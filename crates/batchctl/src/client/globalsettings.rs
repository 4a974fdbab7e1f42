use crate::client::output::outputs::Output;
use crate::config::BackendConfig;

pub struct GlobalSettings {
    config: BackendConfig,
    printer: Box<dyn Output>,
}

impl GlobalSettings {
    pub fn new(config: BackendConfig, printer: Box<dyn Output>) -> Self {
        GlobalSettings { config, printer }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn printer(&self) -> &dyn Output {
        self.printer.as_ref()
    }
}
