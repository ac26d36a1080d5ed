//! User table and authentication.
//!
//! Users are rows loaded from the protected image-filesystem file
//! `/prot/passwd`; a row's index is its UID. UID 0 is always root. Resource
//! access (`Resource::access_ok`, in `fs::mod`) depends on this table only
//! through the UID values it hands out — the table itself never gates file
//! access directly.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Upper bound on the number of distinct users a boot image may define.
pub const MAX_USERS: usize = 32;
/// Maximum length of a user name or password, including the nul terminator.
pub const USER_FIELD_LEN: usize = 32;

#[derive(Debug, Clone, Copy)]
struct User {
    name: [u8; USER_FIELD_LEN],
    password: [u8; USER_FIELD_LEN],
    valid: bool,
}

impl User {
    const EMPTY: Self = Self {
        name: [0; USER_FIELD_LEN],
        password: [0; USER_FIELD_LEN],
        valid: false,
    };

    fn set_field(field: &mut [u8; USER_FIELD_LEN], text: &str) {
        *field = [0; USER_FIELD_LEN];
        let bytes = text.as_bytes();
        let len = bytes.len().min(USER_FIELD_LEN - 1);
        field[..len].copy_from_slice(&bytes[..len]);
    }

    fn name_str(&self) -> &str {
        let nul = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..nul]).unwrap_or("")
    }

    fn password_str(&self) -> &str {
        let nul = self
            .password
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.password.len());
        core::str::from_utf8(&self.password[..nul]).unwrap_or("")
    }
}

/// The loaded set of users. UID is the index into `users`.
pub struct UserTable {
    users: [User; MAX_USERS],
    count: usize,
}

impl UserTable {
    /// An empty table (no users defined). `login` always fails against it.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            users: [User::EMPTY; MAX_USERS],
            count: 0,
        }
    }

    /// Parses `/prot/passwd`'s contents: alternating name/password lines,
    /// one user per pair. A dangling trailing name with no paired password
    /// line is invalid, matching `load_users`.
    pub fn load(contents: &str) -> KernelResult<Self> {
        let mut table = Self::empty();
        let mut lines = contents.lines();

        loop {
            let Some(name) = lines.next() else { break };
            let Some(password) = lines.next() else {
                return Err(KernelError::InvalidArgument);
            };
            if table.count >= MAX_USERS {
                return Err(KernelError::NoFreeResource);
            }

            let mut user = User::EMPTY;
            User::set_field(&mut user.name, name);
            User::set_field(&mut user.password, password);
            user.valid = true;
            table.users[table.count] = user;
            table.count += 1;
        }

        Ok(table)
    }

    fn find_by_name(&self, name: &str) -> Option<u32> {
        self.users[..self.count]
            .iter()
            .position(|u| u.valid && u.name_str() == name)
            .map(|idx| idx as u32)
    }

    /// Authenticates `name`/`password`, returning the matched UID.
    ///
    /// `NotFound` if no user has that name, `PermissionDenied` if the name
    /// matches but the password does not, matching `login`'s two distinct
    /// failure codes.
    pub fn login(&self, name: &str, password: &str) -> KernelResult<u32> {
        let uid = self.find_by_name(name).ok_or(KernelError::NotFound)?;
        if self.users[uid as usize].password_str() == password {
            Ok(uid)
        } else {
            Err(KernelError::PermissionDenied)
        }
    }

    /// Re-validates `password` for an already-known `uid`, the check
    /// `switch_user` performs before changing the calling process's
    /// effective identity.
    pub fn switch_user(&self, uid: u32, password: &str) -> KernelResult<u32> {
        let user = self
            .users
            .get(uid as usize)
            .filter(|u| u.valid)
            .ok_or(KernelError::NotFound)?;
        if user.password_str() == password {
            Ok(uid)
        } else {
            Err(KernelError::PermissionDenied)
        }
    }

    /// Looks up a UID's user name, used by `sysgetuser`.
    #[must_use]
    pub fn name_of(&self, uid: u32) -> Option<&str> {
        self.users
            .get(uid as usize)
            .filter(|u| u.valid)
            .map(User::name_str)
    }

    /// Changes another process's effective UID without a password, gated by
    /// caller privilege rather than credentials.
    ///
    /// Only UID 0 may perform a remote switch: this kernel resolves the
    /// "should remote switch-user require elevated privilege" open question
    /// by requiring root, rather than the narrower `target_uid >
    /// caller_uid` rule the original sandbox build used (see `DESIGN.md`).
    pub fn remote_switch_user(&self, caller_uid: u32, target_uid: u32) -> KernelResult<u32> {
        if caller_uid != 0 {
            return Err(KernelError::PrivilegeDenied);
        }
        self.users
            .get(target_uid as usize)
            .filter(|u| u.valid)
            .map(|_| target_uid)
            .ok_or(KernelError::NotFound)
    }
}

/// The global, boot-loaded user table.
pub static USER_TABLE: Mutex<UserTable> = Mutex::new(UserTable::empty());

/// Installs the boot-loaded user table, replacing the empty default.
pub fn init(table: UserTable) {
    *USER_TABLE.lock() = table;
}

#[cfg(test)]
mod tests {
    use super::UserTable;
    use crate::error::KernelError;

    #[test_case]
    fn login_succeeds_with_matching_password() {
        let table = UserTable::load("root\ntoor\nguest\nguest\n").expect("valid passwd file");
        assert_eq!(table.login("root", "toor"), Ok(0));
        assert_eq!(table.login("guest", "guest"), Ok(1));
    }

    #[test_case]
    fn login_rejects_wrong_password_distinctly_from_missing_user() {
        let table = UserTable::load("root\ntoor\n").expect("valid passwd file");
        assert_eq!(table.login("root", "wrong"), Err(KernelError::PermissionDenied));
        assert_eq!(table.login("nobody", "x"), Err(KernelError::NotFound));
    }

    #[test_case]
    fn dangling_trailing_name_is_rejected() {
        assert!(UserTable::load("root\ntoor\nhalf").is_err());
    }

    #[test_case]
    fn only_root_may_remote_switch() {
        let table = UserTable::load("root\ntoor\nguest\nguest\n").expect("valid passwd file");
        assert_eq!(table.remote_switch_user(0, 1), Ok(1));
        assert_eq!(
            table.remote_switch_user(1, 0),
            Err(KernelError::PrivilegeDenied)
        );
    }
}
