pub mod rect;

pub use rect::{layout_rect_ltwh, LayoutRect, Margins};

use serde::{Deserialize, Serialize};

/// Layout mode declared by an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    NoDisplay,
    Fixed,
    FixedHeight,
    #[default]
    Responsive,
    Container,
    Fill,
    Flex,
    Intrinsic,
    /// Zero height is a valid measurement for fluid elements.
    Fluid,
}

/// Lower values are laid out first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum LayoutPriority {
    #[default]
    Content = 0,
    Metadata = 1,
    Ads = 2,
    Background = 3,
}
