use anyhow::Result;

use crate::detect::result::RankedDetection;
use crate::frame::FrameView;

/// Detector model behind the inference adapter.
///
/// Implementations receive a borrowed `FrameView` and must treat its pixels as
/// read-only and ephemeral: nothing from the frame may be kept past the call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one frame. Boxes are normalized to the frame size.
    fn detect(&mut self, frame: &FrameView<'_>) -> Result<Vec<RankedDetection>>;

    /// Optional warm-up hook, run once after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
