//! Voice transcoding to AMR via the ffmpeg CLI.
//!
//! WeCom voice messages accept only `amr`/`speex`; hosts usually hand us
//! `wav` or `mp3`. When ffmpeg is present we convert, otherwise callers
//! fall back to sending the audio as a plain file.

use std::{path::{Path, PathBuf}, process::Stdio};

use {tokio::process::Command, tracing::debug};

use crate::error::{Error, Result};

/// Whether an ffmpeg binary is reachable on PATH.
#[must_use]
pub fn ffmpeg_available() -> bool {
    which::which("ffmpeg").is_ok()
}

/// The fixed argument set WeCom's AMR-NB expects.
#[must_use]
pub fn amr_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-i".into(),
        input.display().to_string(),
        "-ar".into(),
        "8000".into(),
        "-ac".into(),
        "1".into(),
        "-c:a".into(),
        "amr_nb".into(),
        output.display().to_string(),
    ]
}

/// Transcode `input` to an `.amr` sibling file and return its path.
/// The caller owns deleting the result after upload.
pub async fn transcode_to_amr(input: &Path) -> Result<PathBuf> {
    if !ffmpeg_available() {
        return Err(Error::invalid_input("ffmpeg not found on PATH"));
    }
    let output = input.with_extension("amr");
    let args = amr_args(input, &output);

    let status = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;

    if !status.success() {
        let _ = tokio::fs::remove_file(&output).await;
        return Err(Error::invalid_input(format!(
            "ffmpeg exited with {status}"
        )));
    }
    debug!(input = %input.display(), output = %output.display(), "voice transcoded to amr");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amr_args_match_the_wecom_profile() {
        let args = amr_args(Path::new("/tmp/a.wav"), Path::new("/tmp/a.amr"));
        let joined = args.join(" ");
        assert!(joined.contains("-ar 8000"));
        assert!(joined.contains("-ac 1"));
        assert!(joined.contains("-c:a amr_nb"));
        assert!(joined.starts_with("-y -i /tmp/a.wav"));
        assert!(joined.ends_with("/tmp/a.amr"));
    }

    #[test]
    fn output_path_swaps_extension() {
        let input = Path::new("/tmp/voice_1.wav");
        assert_eq!(input.with_extension("amr"), Path::new("/tmp/voice_1.amr"));
    }
}
