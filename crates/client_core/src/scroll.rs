/// Distance from the bottom, in pixels, still counted as "at the bottom".
pub const NEAR_BOTTOM_PX: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }

    pub fn is_near_bottom(&self) -> bool {
        self.distance_from_bottom() <= NEAR_BOTTOM_PX
    }
}

/// New `scroll_top` after the list content was replaced, or `None` to leave
/// the position alone.
///
/// A reader scrolled into history keeps their place: the offset moves by the
/// height the content grew by. Near the bottom, the view only follows the
/// new bottom when the newest message is the local user's own.
pub fn restore_position(
    before: ScrollMetrics,
    new_scroll_height: f64,
    newest_is_own: bool,
) -> Option<f64> {
    if !before.is_near_bottom() {
        let delta = new_scroll_height - before.scroll_height;
        if delta == 0.0 {
            return None;
        }
        return Some((before.scroll_top + delta).max(0.0));
    }
    if newest_is_own {
        return Some((new_scroll_height - before.client_height).max(0.0));
    }
    None
}
