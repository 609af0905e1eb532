pub mod config_cmd;
pub mod track;
pub mod watch;

use sessionview_core::ProtocolFamily;

pub(crate) fn parse_family(name: &str) -> anyhow::Result<ProtocolFamily> {
    ProtocolFamily::parse(name).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown protocol family '{}'. Expected one of: screencast, framebuffer, terminal",
            name
        )
    })
}
