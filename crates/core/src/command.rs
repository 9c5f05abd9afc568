//! Command line for the engine's console submitter.
//!
//! Layout: `<description path> <flags> <options>` where the description path
//! is relative to the submitter's project base (`artist\job\file.xml`).

/// Client groups the job may run on.
pub const CLIENT_GROUPS: &[&str] = &["Sandtrooper"];

/// Builds the submitter arguments for one job.
#[derive(Debug, Clone)]
pub struct SubmitCommand<'a> {
    pub description: &'a str,
    pub artist_id: &'a str,
    pub renderjob_id: &'a str,
}

impl<'a> SubmitCommand<'a> {
    pub fn new(description: &'a str, artist_id: &'a str, renderjob_id: &'a str) -> Self {
        Self {
            description,
            artist_id,
            renderjob_id,
        }
    }

    fn scene_path(&self) -> String {
        format!("{}\\{}\\{}", self.artist_id, self.renderjob_id, self.description)
    }

    /// `-ADE` deletes existing frames, `-NSEC` skips the scene existence check.
    fn flags(&self) -> String {
        if self.artist_id.is_empty() {
            "-ADE -NSEC".to_string()
        } else {
            format!("-ADE -NSEC -CustomArtistID {}", self.artist_id)
        }
    }

    fn options(&self) -> String {
        format!(
            "\"DCG=1~{}\" \"UN=1~{}\" \"CPN=1~{}\" \"PPUpdaterrRemoteFin=1~1\"",
            CLIENT_GROUPS.join(";"),
            self.artist_id,
            self.renderjob_id
        )
    }

    /// The full option string sent to the execution proxy.
    pub fn render(&self) -> String {
        format!("{} {} {}", self.scene_path(), self.flags(), self.options())
    }
}

impl std::fmt::Display for SubmitCommand<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// Split a rendered option string into arguments, honouring double quotes.
pub fn split_arguments(options: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut pending = false;

    for c in options.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                pending = true;
            }
            c if c.is_whitespace() && !quoted => {
                if pending {
                    args.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if pending {
        args.push(current);
    }
    args
}
