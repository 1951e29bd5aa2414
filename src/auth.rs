use anyhow::{Result, bail};
use std::io::{self, BufRead, IsTerminal};
use zeroize::Zeroizing;

pub const ENV_PASSPHRASE: &str = "KEYWARD_PASSPHRASE";

pub fn read_passphrase() -> Result<Zeroizing<String>> {
    //  Environment Variable
    //  KEYWARD_PASSPHRASE="supersecret" keyward encrypt report.csv
    if let Some(pw) = passphrase_from_env() {
        return Ok(pw);
    }

    //  stdin (Pipeline)
    //  printf "%s" "$PASS" | keyward stats
    if !io::stdin().is_terminal() {
        let mut buf = Zeroizing::new(String::new());
        io::stdin().read_line(&mut buf)?;
        trim_newline(&mut buf);

        if !buf.is_empty() {
            return Ok(buf);
        }
    }

    //  Interactive (TTY)
    if io::stdin().is_terminal() {
        let pw = Zeroizing::new(rpassword::prompt_password("Passphrase: ")?);
        if !pw.is_empty() {
            return Ok(pw);
        }
    }

    bail!("no passphrase provided (set {ENV_PASSPHRASE} or use --unprotected)")
}

pub fn read_new_passphrase_with_confirmation() -> Result<Zeroizing<String>> {
    if let Some(pw) = passphrase_from_env() {
        return Ok(pw);
    }

    let (pw1, pw2) = if io::stdin().is_terminal() {
        (
            Zeroizing::new(rpassword::prompt_password("New passphrase: ")?),
            Zeroizing::new(rpassword::prompt_password("Confirm passphrase: ")?),
        )
    } else {
        let stdin = io::stdin();
        let mut handle = stdin.lock();

        let mut pw1 = Zeroizing::new(String::new());
        let mut pw2 = Zeroizing::new(String::new());

        handle.read_line(&mut pw1)?;
        handle.read_line(&mut pw2)?;

        trim_newline(&mut pw1);
        trim_newline(&mut pw2);
        (pw1, pw2)
    };

    if pw1.is_empty() {
        bail!("passphrase cannot be empty");
    }

    if pw1 != pw2 {
        bail!("passphrases do not match");
    }

    Ok(pw1)
}

fn passphrase_from_env() -> Option<Zeroizing<String>> {
    std::env::var(ENV_PASSPHRASE)
        .ok()
        .filter(|pw| !pw.is_empty())
        .map(Zeroizing::new)
}

fn trim_newline(s: &mut String) {
    while s.ends_with('\n') || s.ends_with('\r') {
        s.pop();
    }
}
