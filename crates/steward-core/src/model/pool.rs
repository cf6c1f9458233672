#[allow(deprecated)]
use rig::client::completion::CompletionModelHandle;

use super::ModelTier;

/// Completion handles resolved once per tier at start-up.
///
/// The capable tier is mandatory. Requests for the light tier fall back to
/// capable when no light model is configured.
#[allow(deprecated)]
#[derive(Clone)]
pub struct ModelPool {
    /// (model_handle, model_name_for_logging)
    capable: (CompletionModelHandle<'static>, String),
    light: Option<(CompletionModelHandle<'static>, String)>,
}

#[allow(deprecated)]
impl ModelPool {
    pub fn new(
        capable: (CompletionModelHandle<'static>, String),
        light: Option<(CompletionModelHandle<'static>, String)>,
    ) -> Self {
        Self { capable, light }
    }

    pub fn get(&self, tier: ModelTier) -> (&CompletionModelHandle<'static>, &str) {
        let (handle, name) = match tier {
            ModelTier::Light => self.light.as_ref().unwrap_or(&self.capable),
            ModelTier::Capable => &self.capable,
        };
        (handle, name)
    }

    /// Configured tiers with the model name each resolves to.
    pub fn describe(&self) -> Vec<(ModelTier, &str)> {
        vec![
            (ModelTier::Light, self.get(ModelTier::Light).1),
            (ModelTier::Capable, self.get(ModelTier::Capable).1),
        ]
    }
}
