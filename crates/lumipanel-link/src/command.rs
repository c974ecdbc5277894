//! Display command formatting.
//!
//! Commands follow the `<target>.<field>=<value>` convention, with a
//! handful of verb-style exceptions (`page`, `vis`, `get`, `dim=`).
//! The terminator is appended by the write path, not here.

use crate::update::ProtocolVariant;

/// Navigates the display to a page.
pub fn go_to_page(page: &str) -> String {
    format!("page {page}")
}

/// Sets a text component's content.
pub fn set_text(component: &str, text: &str) -> String {
    format!("{component}.txt=\"{text}\"")
}

/// Sets a component's integer value (slider position, progress, ...).
pub fn set_value(component: &str, value: i32) -> String {
    format!("{component}.val={value}")
}

/// Shows or hides a component.
pub fn set_visibility(component: &str, visible: bool) -> String {
    format!("vis {component},{}", u8::from(visible))
}

/// Sets a component's foreground color (RGB565).
pub fn set_foreground(component: &str, color: u16) -> String {
    format!("{component}.pco={color}")
}

/// Sets a picture component's image index.
pub fn set_pic(component: &str, pic: u8) -> String {
    format!("{component}.pic={pic}")
}

/// Sets a timer component's interval in milliseconds.
pub fn set_timer(component: &str, interval_ms: u16) -> String {
    format!("{component}.tim={interval_ms}")
}

/// Sets the backlight brightness. Bypasses the page-field convention.
pub fn set_brightness(percent: u8) -> String {
    format!("dim={percent}")
}

/// Requests a component's integer value; the display answers with a
/// numeric response frame.
pub fn get_value(component: &str) -> String {
    format!("get {component}.val")
}

/// Begin-upload command opening a firmware/GUI transfer.
pub fn begin_upload(total_size: u64, baud_rate: u32, variant: ProtocolVariant) -> String {
    match variant {
        ProtocolVariant::V1 => format!("whmi-wri {total_size},{baud_rate},1"),
        ProtocolVariant::V2 => format!("whmi-wris {total_size},{baud_rate},1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_navigation() {
        assert_eq!(go_to_page("home"), "page home");
    }

    #[test]
    fn component_field_commands() {
        assert_eq!(set_text("t0", "Kitchen"), "t0.txt=\"Kitchen\"");
        assert_eq!(set_value("s_bright", 75), "s_bright.val=75");
        assert_eq!(set_foreground("t0", 65535), "t0.pco=65535");
        assert_eq!(set_pic("p0", 4), "p0.pic=4");
        assert_eq!(set_timer("tm0", 500), "tm0.tim=500");
    }

    #[test]
    fn visibility_flag_is_numeric() {
        assert_eq!(set_visibility("b0", true), "vis b0,1");
        assert_eq!(set_visibility("b0", false), "vis b0,0");
    }

    #[test]
    fn brightness_bypasses_field_convention() {
        assert_eq!(set_brightness(80), "dim=80");
    }

    #[test]
    fn value_query() {
        assert_eq!(get_value("s_bright"), "get s_bright.val");
    }

    #[test]
    fn begin_upload_variants() {
        assert_eq!(
            begin_upload(1_048_576, 921_600, ProtocolVariant::V1),
            "whmi-wri 1048576,921600,1"
        );
        assert_eq!(
            begin_upload(1_048_576, 921_600, ProtocolVariant::V2),
            "whmi-wris 1048576,921600,1"
        );
    }
}
