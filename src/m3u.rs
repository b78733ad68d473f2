// src/m3u.rs
//
// Playlist served for /playlist.m3u. Fetching and transforming upstream
// playlists belongs to the external M3U collaborator; here the transformed
// payload is loaded once at startup and served out of pool buffers.
use log::{info, warn};
use std::path::Path;

pub struct Playlist {
    body: Option<String>,
}

impl Playlist {
    pub fn load(path: Option<&str>) -> Self {
        let body = match path {
            Some(p) => match std::fs::read_to_string(Path::new(p)) {
                Ok(s) if !s.is_empty() => {
                    info!("playlist: loaded {} bytes from {}", s.len(), p);
                    Some(s)
                }
                Ok(_) => {
                    warn!("playlist: {} is empty", p);
                    None
                }
                Err(e) => {
                    warn!("playlist: cannot read {}: {}", p, e);
                    None
                }
            },
            None => None,
        };
        Self { body }
    }

    pub fn get(&self) -> Option<&str> {
        self.body.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn missing_playlist_serves_nothing() {
        let p = Playlist::load(None);
        assert!(p.get().is_none());
        let p = Playlist::load(Some("/does/not/exist.m3u"));
        assert!(p.get().is_none());
    }

    #[test]
    fn loads_existing_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("rtpgate-test-playlist.m3u");
        let body = "#EXTM3U\n#EXTINF:-1,ch1\nhttp://gw/ch1\n";
        File::create(&path).unwrap().write_all(body.as_bytes()).unwrap();

        let p = Playlist::load(path.to_str());
        assert_eq!(p.get(), Some(body));
        std::fs::remove_file(&path).ok();
    }
}
