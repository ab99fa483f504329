//! Generated device scripts and the adapter that turns their printed
//! tokens into a [`ScriptOutcome`].
//!
//! Every path reaches a script through [`py_str`], so a payload is always
//! a complete, valid program whatever the path contains.

use crate::repl::types::{
    ScriptOutcome, COMPLETION_TOKEN, DOWNLOAD_CHUNK_SIZE, DOWNLOAD_TERMINATOR, HEADER_DIGITS,
    SEND_BLOCK_SIZE,
};

pub const RM_OK: &str = "rm_worked";
pub const RM_FAILED: &str = "rm_failed";
pub const RENAME_OK: &str = "no_rename_error";
pub const RENAME_FAILED: &str = "rename_error";
pub const MKDIR_OK: &str = "mkdir_done";
pub const MKDIR_FAILED: &str = "mkdir_failed";
pub const UPLOAD_OK: &str = "upload_done";
pub const UPLOAD_FAILED: &str = "upload_failed";
/// Written just before the download terminator when the read failed.
pub const READ_FAILED: &str = "###READ FAILED###";

/// Quote `s` as a single-quoted Python string literal.
pub fn py_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c == '\x7f' => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

const RM_DEF: &str = "\
import os
def rm(d):
    try:
        if os.stat(d)[0] & 0x4000:
            for f in os.ilistdir(d):
                if f[0] not in ('.', '..'):
                    rm('/'.join((d, f[0])))
            os.rmdir(d)
        else:
            os.remove(d)
        print('rm_worked')
    except:
        print('rm_failed')
";

/// Recursive walk printing the tree as JSON.
pub fn listing_script() -> String {
    "\
import os
import ujson
def walk(top, structure, name):
    sep = '/' if top != '' else ''
    index = 0
    structure[name] = {}
    for entry in os.listdir(top):
        mode = os.stat(top + sep + entry)[0]
        if mode & 0x4000:
            structure[name][index] = {'D': entry}
            index += 1
            walk(top + sep + entry, structure[name], entry)
        elif mode & 0x8000:
            structure[name][index] = {'F': entry}
            index += 1
    return structure
print(ujson.dumps(walk('', {}, '')))
"
    .to_string()
}

/// Remove a file or a whole tree.
pub fn remove_script(path: &str) -> String {
    format!("{}rm({})\n", RM_DEF, py_str(path))
}

/// Remove every entry of the root directory.
pub fn remove_all_script() -> String {
    format!(
        "{}for f in os.listdir('/'):\n    rm('/' + f)\nprint('{}')\n",
        RM_DEF, RM_OK
    )
}

/// Rename `old` to `new` unless `new` already exists.
pub fn rename_script(old: &str, new: &str) -> String {
    format!(
        "\
import os
try:
    os.stat({new})
    exists = True
except OSError:
    exists = False
if exists:
    print('{fail}')
else:
    try:
        os.rename({old}, {new})
        print('{ok}')
    except OSError as err:
        print('{fail}', err)
",
        old = py_str(old),
        new = py_str(new),
        ok = RENAME_OK,
        fail = RENAME_FAILED,
    )
}

/// Create every segment of `path`; existing ones are fine.
pub fn mkdir_script(path: &str) -> String {
    format!(
        "\
import os
try:
    built = ''
    for part in {path}.split('/'):
        if not part:
            continue
        built = built + '/' + part
        try:
            os.mkdir(built)
        except OSError:
            pass
    print('{ok}')
except Exception as err:
    print('{fail}', err)
",
        path = py_str(path),
        ok = MKDIR_OK,
        fail = MKDIR_FAILED,
    )
}

/// Receiver for an upload frame.
///
/// Reads the length header on its own, then whole blocks, and keeps only
/// the declared number of bytes. The frame is always drained completely,
/// even when the file cannot be opened, so no payload byte is ever
/// interpreted by the raw REPL. Ctrl-C is disabled while receiving.
pub fn upload_receiver_script(path: &str) -> String {
    format!(
        "\
import micropython
import sys
micropython.kbd_intr(-1)
ok = True
err = ''
w = None
def fill(buf, n):
    view = memoryview(buf)
    got = 0
    while got < n:
        got += sys.stdin.buffer.readinto(view[got:], n - got)
try:
    w = open({path}, 'wb')
except Exception as e:
    ok = False
    err = repr(e)
try:
    head = bytearray({digits})
    fill(head, {digits})
    remaining = int(bytes(head).decode('utf-8'))
    block = bytearray({block})
    while remaining > 0:
        fill(block, {block})
        keep = {block} if remaining > {block} else remaining
        if w:
            w.write(memoryview(block)[0:keep])
        remaining -= keep
except Exception as e:
    ok = False
    err = repr(e)
finally:
    if w:
        w.close()
    micropython.kbd_intr(0x03)
print('{ok}' if ok else '{fail} ' + err)
",
        path = py_str(path),
        digits = HEADER_DIGITS,
        block = SEND_BLOCK_SIZE,
        ok = UPLOAD_OK,
        fail = UPLOAD_FAILED,
    )
}

/// Stream a file to stdout in fixed chunks, then the terminator.
///
/// The terminator is written even when the file cannot be read; the error
/// then comes first, on its own line and followed by [`READ_FAILED`].
pub fn download_script(path: &str) -> String {
    format!(
        "\
import sys
try:
    f = open({path}, 'rb')
    while True:
        data = f.read({chunk})
        if not data:
            break
        sys.stdout.buffer.write(data)
    f.close()
except Exception as err:
    sys.stdout.write('\\n' + str(err) + '{fail}')
sys.stdout.write('{term}')
",
        path = py_str(path),
        chunk = DOWNLOAD_CHUNK_SIZE,
        fail = READ_FAILED,
        term = DOWNLOAD_TERMINATOR,
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Outcome adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lines printed by a script, without the raw REPL's `OK` prefix and
/// end-of-output markers.
pub fn clean_output(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let line = if i == 0 {
                line.strip_prefix(COMPLETION_TOKEN).unwrap_or(line)
            } else {
                line
            };
            line.replace('\x04', "")
        })
        .filter(|line| !line.is_empty() && line != ">")
        .collect()
}

/// Classify a script's output by its success and failure tokens.
///
/// A line equal to `failure`, or starting with `failure` and a space,
/// wins over any success line. No token at all is a failure carrying the
/// last printed line (usually the exception).
pub fn parse_outcome(lines: &[String], success: &str, failure: &str) -> ScriptOutcome {
    let cleaned = clean_output(lines);
    let mut succeeded = false;
    for line in &cleaned {
        let line = line.trim();
        if line == failure {
            return ScriptOutcome::Failure(failure.to_string());
        }
        if let Some(detail) = line.strip_prefix(failure).and_then(|r| r.strip_prefix(' ')) {
            return ScriptOutcome::Failure(detail.trim().to_string());
        }
        if line == success {
            succeeded = true;
        }
    }
    if succeeded {
        ScriptOutcome::Success
    } else {
        ScriptOutcome::Failure(
            cleaned
                .last()
                .map(|l| l.trim().to_string())
                .unwrap_or_else(|| "no response from device".to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_py_str_escapes() {
        assert_eq!(py_str("/main.py"), "'/main.py'");
        assert_eq!(py_str("it's"), r"'it\'s'");
        assert_eq!(py_str(r"a\b"), r"'a\\b'");
        assert_eq!(py_str("x\ny\x01"), r"'x\ny\x01'");
        assert_eq!(py_str("héllo"), "'héllo'");
    }

    #[test]
    fn test_scripts_quote_paths() {
        let s = remove_script("/it's here");
        assert!(s.ends_with("rm('/it\\'s here')\n"));
        let s = rename_script("/a.py", "/b.py");
        assert!(s.contains("os.rename('/a.py', '/b.py')"));
        let s = upload_receiver_script("/lib/x.bin");
        assert!(s.contains("open('/lib/x.bin', 'wb')"));
        assert!(s.contains("micropython.kbd_intr(-1)"));
        assert!(s.contains("bytearray(7)"));
        let s = download_script("/main.py");
        assert!(s.contains("f.read(256)"));
        assert!(s.contains("except Exception as err:"));
        assert!(s.contains("str(err) + '###READ FAILED###'"));
        assert!(s.ends_with("\nsys.stdout.write('###DONE READING FILE###')\n"));
    }

    #[test]
    fn test_listing_script_prints_json() {
        let s = listing_script();
        assert!(s.contains("ujson.dumps(walk('', {}, ''))"));
        assert!(s.contains("0x4000"));
    }

    #[test]
    fn test_clean_output() {
        let out = clean_output(&lines(&["OKrm_worked", "\x04\x04>"]));
        assert_eq!(out, vec!["rm_worked"]);
    }

    #[test]
    fn test_parse_outcome_success() {
        let o = parse_outcome(&lines(&["OKrm_worked", "\x04\x04>"]), RM_OK, RM_FAILED);
        assert_eq!(o, ScriptOutcome::Success);
    }

    #[test]
    fn test_parse_outcome_any_failure_wins() {
        let o = parse_outcome(
            &lines(&["OKrm_worked", "rm_failed", "rm_worked", "\x04\x04>"]),
            RM_OK,
            RM_FAILED,
        );
        assert_eq!(o, ScriptOutcome::Failure("rm_failed".into()));
    }

    #[test]
    fn test_parse_outcome_rename_tokens_do_not_collide() {
        let ok = parse_outcome(&lines(&["OKno_rename_error"]), RENAME_OK, RENAME_FAILED);
        assert!(ok.is_success());
        let fail = parse_outcome(
            &lines(&["OKrename_error [Errno 2] ENOENT"]),
            RENAME_OK,
            RENAME_FAILED,
        );
        assert_eq!(fail, ScriptOutcome::Failure("[Errno 2] ENOENT".into()));
    }

    #[test]
    fn test_parse_outcome_without_token() {
        let o = parse_outcome(
            &lines(&["OK\x04Traceback (most recent call last):", "  File \"<stdin>\", line 3"]),
            RM_OK,
            RM_FAILED,
        );
        assert_eq!(o, ScriptOutcome::Failure("File \"<stdin>\", line 3".into()));
        assert_eq!(
            parse_outcome(&[], RM_OK, RM_FAILED),
            ScriptOutcome::Failure("no response from device".into())
        );
    }
}
