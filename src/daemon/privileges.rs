// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Resolve the target identity and drop root privileges.
// Author: Lukas Bower

//! Privilege handling.
//!
//! The daemon starts as root (to open the UART and bind the control
//! socket), then drops to a configured user. The supplementary group list
//! keeps the groups needed to reach the serial device and the SMBus
//! helpers after the drop; everything else is shed.

use std::ffi::{CStr, CString};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

/// Additional groups the daemon keeps for hardware access.
const EXTRA_GROUPS: &[&str] = &["i2c"];

/// Resolved identity to drop to.
#[derive(Debug, Clone)]
pub struct TargetUser {
    /// Account name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// The account's primary group id.
    pub gid: u32,
}

/// Effective user id of the current process.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() }
}

/// Resolve a user given either an account name or a numeric id.
pub fn resolve_user(user: &str) -> Result<TargetUser> {
    match user.parse::<u32>() {
        Ok(uid) => lookup_passwd(Lookup::Uid(uid)),
        Err(_) => lookup_passwd(Lookup::Name(user.to_string())),
    }
    .with_context(|| format!("cannot resolve user '{user}'"))
}

/// Resolve a group given either a group name or a numeric id.
pub fn resolve_group(group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    let cname = CString::new(group).context("group name contains NUL")?;
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::group = std::ptr::null_mut();
    loop {
        // SAFETY: all pointers reference live buffers for the call.
        let rc = unsafe {
            libc::getgrnam_r(
                cname.as_ptr(),
                &mut grp,
                buf.as_mut_ptr().cast::<libc::c_char>(),
                buf.len(),
                &mut result,
            )
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return Err(anyhow!("cannot resolve group '{group}'"));
        }
        return Ok(grp.gr_gid);
    }
}

enum Lookup {
    Name(String),
    Uid(u32),
}

fn lookup_passwd(key: Lookup) -> Result<TargetUser> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0u8; 4096];
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let cname = match &key {
        Lookup::Name(name) => Some(CString::new(name.as_str()).context("user name contains NUL")?),
        Lookup::Uid(_) => None,
    };
    loop {
        // SAFETY: all pointers reference live buffers for the call.
        let rc = unsafe {
            match (&key, &cname) {
                (Lookup::Name(_), Some(cname)) => libc::getpwnam_r(
                    cname.as_ptr(),
                    &mut pwd,
                    buf.as_mut_ptr().cast::<libc::c_char>(),
                    buf.len(),
                    &mut result,
                ),
                (Lookup::Uid(uid), _) => libc::getpwuid_r(
                    *uid,
                    &mut pwd,
                    buf.as_mut_ptr().cast::<libc::c_char>(),
                    buf.len(),
                    &mut result,
                ),
                _ => unreachable!("name lookup always carries a CString"),
            }
        };
        if rc == libc::ERANGE {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return Err(anyhow!("no such user"));
        }
        // SAFETY: pw_name points into buf, which outlives this block.
        let name = unsafe { CStr::from_ptr(pwd.pw_name) }
            .to_string_lossy()
            .into_owned();
        return Ok(TargetUser {
            name,
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
        });
    }
}

/// Groups the target user is a member of, per the group database.
pub fn supplementary_groups(user: &TargetUser) -> Vec<u32> {
    let Ok(cname) = CString::new(user.name.as_str()) else {
        return vec![user.gid];
    };
    let mut count: libc::c_int = 32;
    let mut groups = vec![0 as libc::gid_t; count as usize];
    loop {
        // SAFETY: groups has capacity for count entries.
        let rc = unsafe {
            libc::getgrouplist(cname.as_ptr(), user.gid, groups.as_mut_ptr(), &mut count)
        };
        if rc == -1 && count as usize > groups.len() {
            groups.resize(count as usize, 0);
            continue;
        }
        if rc < 0 {
            return vec![user.gid];
        }
        groups.truncate(count as usize);
        return groups;
    }
}

/// Owning group of a device node, used to keep UART access after the drop.
pub fn device_group(path: &Path) -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|meta| meta.gid())
}

/// Assemble the supplementary group set for the drop: the user's own
/// groups, the target group, the serial device's group, and the fixed
/// hardware-access groups.
pub fn assemble_groups(user: &TargetUser, target_gid: u32, pmc_port: &Path) -> Vec<u32> {
    let mut groups = supplementary_groups(user);
    let mut push_unique = |gid: u32| {
        if gid != 0 && !groups.contains(&gid) {
            groups.push(gid);
        }
    };
    push_unique(user.gid);
    push_unique(target_gid);
    if let Some(gid) = device_group(pmc_port) {
        push_unique(gid);
    }
    for name in EXTRA_GROUPS {
        if let Ok(gid) = resolve_group(name) {
            push_unique(gid);
        }
    }
    groups
}

/// Drop to the target identity. The UART and control socket stay usable
/// through their already-open descriptors.
pub fn drop_privileges(user: &TargetUser, gid: u32, supplementary: &[u32]) -> Result<()> {
    let euid = effective_uid();

    // SAFETY: supplementary is a live slice of gid_t.
    let rc = unsafe { libc::setgroups(supplementary.len(), supplementary.as_ptr()) };
    if rc != 0 {
        if euid != 0 {
            warn!("not running as root, cannot update supplementary groups");
        } else {
            return Err(anyhow!(
                "setgroups failed: {}",
                std::io::Error::last_os_error()
            ));
        }
    }

    // SAFETY: plain syscall wrappers, no pointers involved.
    if unsafe { libc::setresgid(gid, gid, gid) } != 0 {
        return Err(anyhow!(
            "cannot set group to {gid}: {}",
            std::io::Error::last_os_error()
        ));
    }
    if unsafe { libc::setresuid(user.uid, user.uid, user.uid) } != 0 {
        return Err(anyhow!(
            "cannot set user to {} (id {}): {}",
            user.name,
            user.uid,
            std::io::Error::last_os_error()
        ));
    }
    info!(
        "dropped privileges, now running as {} (uid {}, gid {gid})",
        user.name, user.uid
    );
    Ok(())
}
