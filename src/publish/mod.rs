use anyhow::anyhow;
use tracing::warn;

use crate::{
    error::Result,
    fs::{Dir, DirFile},
    layout::{is_temporary, temp_name},
};

/// Writes `name` in `dir` so that it only ever appears complete.
///
/// The contents go to a temporary file which is synced and then renamed over
/// `name`. A temporary left behind by an earlier, interrupted attempt is
/// discarded first, never resumed. If anything fails the temporary is
/// removed and whatever was previously published under `name` is untouched.
pub fn publish<D, T, F>(dir: &D, name: &str, write: F) -> Result<T>
where
    D: Dir,
    F: FnOnce(&mut D::File) -> Result<T>,
{
    let tmp = temp_name(name);
    if dir.unlink(&tmp)? {
        warn!(dir = %dir.path().display(), file = %tmp, "discarded stale temporary");
    }
    let mut file = dir
        .create(&tmp)?
        .ok_or_else(|| anyhow!("{} was recreated while publishing", tmp))?;

    let written = write(&mut file).and_then(|t| {
        file.sync()?;
        Ok(t)
    });
    drop(file);

    let published = written.and_then(|t| {
        dir.rename(&tmp, &name)?;
        Ok(t)
    });
    match published {
        Ok(t) => {
            dir.sync()?;
            Ok(t)
        }
        Err(e) => {
            discard(dir, &tmp);
            Err(e)
        }
    }
}

fn discard<D: Dir>(dir: &D, tmp: &str) {
    // The filesystem may be the reason we're here; the next attempt or sweep
    // gets another chance at it.
    if let Err(e) = dir.unlink(&tmp) {
        warn!(dir = %dir.path().display(), file = %tmp, error = %e, "failed to remove temporary");
    }
}

/// Creates the subdirectory `name` of `parent` and syncs `parent`, so a
/// file later published into it can't be lost along with the directory
/// entry.
pub fn create_dir<D: Dir>(parent: &D, name: &str) -> Result<D> {
    let dir = parent.cd(&name);
    dir.mkdir()?;
    parent.sync()?;
    Ok(dir)
}

/// Removes every temporary file at or below `dir`. Returns how many were
/// removed.
pub fn sweep_temporaries<D: Dir>(dir: &D) -> Result<usize> {
    if !dir.exists()? {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in dir.ls()? {
        if entry.is_dir {
            removed += sweep_temporaries(&dir.cd(&entry.name))?;
        } else if is_temporary(&entry.name) && dir.unlink(&entry.name)? {
            warn!(dir = %dir.path().display(), file = %entry.name, "discarded stale temporary");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use super::{create_dir, publish, sweep_temporaries};
    use crate::{
        error::{Error, Result},
        fs::{Dir, Event, MockDir},
        layout::is_temporary,
    };

    fn assert_temporaries_gone<D: Dir>(dir: &D) -> Result<()> {
        for entry in dir.ls()? {
            if entry.is_dir {
                assert_temporaries_gone(&dir.cd(&entry.name))?;
            } else if is_temporary(&entry.name) {
                return Err(Error::corrupt(dir.path().join(&entry.name), "left behind"));
            }
        }
        Ok(())
    }

    fn read(dir: &MockDir, name: &str) -> Option<String> {
        let mut f = dir.open(&name).unwrap()?;
        let mut s = String::new();
        f.read_to_string(&mut s).unwrap();
        Some(s)
    }

    #[test]
    fn test_publish_protocol() {
        let dir = MockDir::new();
        let out = dir.cd(&"out");
        publish(&out, "data", |f| Ok(f.write_all(b"contents")?)).unwrap();
        assert_eq!(Some("contents".into()), read(&out, "data"));

        let events = dir.fs().take_events();
        let mut trace = String::new();
        for event in events {
            if let Event::Write(..) = event {
                continue;
            }
            event.write_abbrev(&mut trace).unwrap();
            trace.push('\n');
        }
        assert_eq!(
            "Unlink(out/data.tmp)\n\
             Create(out/data.tmp, 0)\n\
             Sync(0)\n\
             Rename(out/data.tmp, out/data)\n\
             SyncDir(out)\n\
             Open(out/data)\n",
            trace
        );
    }

    #[test]
    fn test_create_dir_syncs_parent() {
        let dir = MockDir::new();
        let out = dir.cd(&"out");
        let part = create_dir(&out, "partition=a").unwrap();
        publish(&part, "batch_0", |f| Ok(f.write_all(b"x")?)).unwrap();

        let events = dir.fs().take_events();
        let mut trace = String::new();
        for event in events {
            if let Event::Write(..) = event {
                continue;
            }
            event.write_abbrev(&mut trace).unwrap();
            trace.push('\n');
        }
        assert_eq!(
            "Mkdir(out/partition=a)\n\
             SyncDir(out)\n\
             Unlink(out/partition=a/batch_0.tmp)\n\
             Create(out/partition=a/batch_0.tmp, 0)\n\
             Sync(0)\n\
             Rename(out/partition=a/batch_0.tmp, out/partition=a/batch_0)\n\
             SyncDir(out/partition=a)\n",
            trace
        );
    }

    #[test]
    fn test_failed_write_keeps_previous() {
        let dir = MockDir::new();
        publish(&dir, "data", |f| Ok(f.write_all(b"v1")?)).unwrap();

        let err = publish(&dir, "data", |f| {
            f.write_all(b"half of v2")?;
            Err::<(), _>(Error::corrupt("input", "bad"))
        })
        .unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));

        assert_eq!(Some("v1".into()), read(&dir, "data"));
        assert_eq!(None, read(&dir, "data.tmp"));
    }

    #[test]
    fn test_stale_temporary_is_discarded() {
        let dir = MockDir::new();
        {
            let mut stale = dir.create(&"data.tmp").unwrap().unwrap();
            stale.write_all(b"partial garbage").unwrap();
        }
        publish(&dir, "data", |f| Ok(f.write_all(b"fresh")?)).unwrap();
        assert_eq!(Some("fresh".into()), read(&dir, "data"));
        assert_temporaries_gone(&dir).unwrap();
    }

    #[test]
    fn test_crash_never_exposes_partial_file() {
        for crash_after in 0..6 {
            let dir = MockDir::new();
            dir.fs().schedule_crash(crash_after);
            let result = publish(&dir, "data", |f| {
                f.write_all(b"0123")?;
                f.write_all(b"4567")?;
                Ok(())
            });
            dir.fs().reboot();

            match read(&dir, "data") {
                None => assert!(result.is_err(), "crash_after={}", crash_after),
                Some(s) => assert_eq!("01234567", s, "crash_after={}", crash_after),
            }

            sweep_temporaries(&dir).unwrap();
            assert_temporaries_gone(&dir).unwrap();
        }
    }

    #[test]
    fn test_sweep_temporaries() {
        let dir = MockDir::new();
        dir.cd(&"partition=a").create(&"batch_0.tmp").unwrap();
        dir.cd(&"partition=a").create(&"batch_1").unwrap();
        dir.cd(&"partition=b").create(&"data.tmp").unwrap();
        dir.create(&"batch_7.tmp").unwrap();

        assert_eq!(3, sweep_temporaries(&dir).unwrap());
        assert_eq!(0, sweep_temporaries(&dir).unwrap());
        assert_eq!(
            vec!["partition=a/batch_1".to_owned()],
            dir.fs().file_names()
        );
        assert_eq!(0, sweep_temporaries(&dir.cd(&"missing")).unwrap());
    }
}
