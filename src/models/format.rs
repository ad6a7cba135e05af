//! Closed set of renditions the conversion cache can produce.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetFormat {
    Jpeg,
    Png,
}

impl TargetFormat {
    pub const ALL: [TargetFormat; 2] = [TargetFormat::Jpeg, TargetFormat::Png];

    /// Parse a requested format. Unknown names yield `None`, which callers
    /// treat as "serve the original".
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    /// Pick the first recognized format among bare query flags (`?jpg`, `?png`).
    pub fn from_flags<'a>(flags: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        flags.into_iter().find_map(Self::parse)
    }

    /// File extension used for cached artifacts.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }
}

impl fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aliases_and_falls_back() {
        assert_eq!(TargetFormat::parse("jpg"), Some(TargetFormat::Jpeg));
        assert_eq!(TargetFormat::parse("JPEG"), Some(TargetFormat::Jpeg));
        assert_eq!(TargetFormat::parse("png"), Some(TargetFormat::Png));
        assert_eq!(TargetFormat::parse("webp"), None);
        assert_eq!(TargetFormat::parse(""), None);
    }

    #[test]
    fn flags_pick_first_known_format() {
        assert_eq!(
            TargetFormat::from_flags(["download", "png"]),
            Some(TargetFormat::Png)
        );
        assert_eq!(TargetFormat::from_flags(["x", "y"]), None);
    }

    #[test]
    fn extension_round_trips() {
        for format in TargetFormat::ALL {
            assert_eq!(TargetFormat::from_extension(format.extension()), Some(format));
        }
        assert_eq!(TargetFormat::from_extension("gif"), None);
    }
}
