use std::borrow::Cow;

use indicatif::ProgressBar;

/// Either a live spinner or plain line printing, behind one surface.
///
/// The plain variant exists for CI logs and `hide_spinner` contexts where
/// terminal control sequences would only add noise.
#[derive(Debug, Default)]
pub(crate) enum ProgressRenderer {
    #[default]
    Plain,
    Indicatif(ProgressBar),
}

impl From<ProgressBar> for ProgressRenderer {
    fn from(pb: ProgressBar) -> Self {
        Self::Indicatif(pb)
    }
}

impl ProgressRenderer {
    pub(crate) fn set_message(&self, msg: impl Into<Cow<'static, str>>) {
        match self {
            Self::Plain => println!("{}", msg.into()),
            Self::Indicatif(pb) => pb.set_message(msg),
        }
    }

    pub(crate) fn println(&self, msg: impl AsRef<str>) {
        match self {
            Self::Plain => println!("{}", msg.as_ref()),
            Self::Indicatif(pb) => pb.println(msg),
        }
    }

    pub(crate) fn finish_and_clear(&self) {
        if let Self::Indicatif(pb) = self {
            pb.finish_and_clear()
        }
    }
}
