//! The textual goal language.
//!
//! One goal per line:
//!
//! ```text
//! 1 some_name: _ _ ssd        # three copies, one of them on ssd
//! 12 standard : $std {_ _ _}
//! 13 fast     : $xor2 { A A A }
//! 14 wide     : $ec(4,2) {A B}
//! 15 xor5any  : $xor5
//! ```
//!
//! For `$std` the braces hold one label per requested copy. For `$xorN`
//! and `$ec(k,m)` they hold one label per part in part order (parity
//! first for XOR), missing labels defaulting to the wildcard. Goal ids
//! not mentioned in the configuration get a default goal of `id` plain
//! copies (capped like the compatibility goals of old clusters).

use std::collections::BTreeMap;

use anyhow::{bail, format_err, Error};
use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1, satisfy};
use nom::combinator::{map_res, opt, recognize};
use nom::multi::many1;
use nom::sequence::{delimited, preceded, tuple};

use sfs_tools::nom::{multispace0, IResult};
use sfs_types::goal::GoalId;
use sfs_types::label::is_label_valid;
use sfs_types::{Goal, MediaLabel, Slice, SliceType};

/// Copies requested by a default goal are capped at this value, matching
/// clusters that treat the goal id as a plain copy count.
const MAX_DEFAULT_COPIES: u32 = 5;

fn parse_u32(i: &str) -> IResult<&str, u32> {
    map_res(recognize(digit1), str::parse)(i)
}

fn token(i: &str) -> IResult<&str, &str> {
    recognize(many1(satisfy(|c: char| c.is_ascii_alphanumeric() || c == '_')))(i)
}

fn slice_type(i: &str) -> IResult<&str, SliceType> {
    preceded(
        char('$'),
        alt((
            map_res(preceded(tag("xor"), parse_u32), |level| {
                SliceType::xor(level.try_into().map_err(Error::from)?)
            }),
            map_res(
                preceded(
                    tag("ec"),
                    delimited(
                        char('('),
                        tuple((
                            preceded(multispace0, parse_u32),
                            preceded(
                                tuple((multispace0, char(','), multispace0)),
                                parse_u32,
                            ),
                        )),
                        preceded(multispace0, char(')')),
                    ),
                ),
                |(k, m)| {
                    SliceType::ec(
                        k.try_into().map_err(Error::from)?,
                        m.try_into().map_err(Error::from)?,
                    )
                },
            ),
            map_res(tag("std"), |_| Ok::<_, Error>(SliceType::Standard)),
        )),
    )(i)
}

fn label_list(i: &str) -> IResult<&str, Vec<&str>> {
    many1(preceded(multispace0, token))(i)
}

struct ParsedLine {
    goal_id: u32,
    name: String,
    slice_type: SliceType,
    labels: Vec<String>,
}

fn goal_line(i: &str) -> IResult<&str, ParsedLine> {
    let (i, _) = multispace0(i)?;
    let (i, goal_id) = parse_u32(i)?;
    let (i, _) = multispace0(i)?;
    let (i, name) = token(i)?;
    let (i, _) = multispace0(i)?;
    let (i, _) = char(':')(i)?;
    let (i, _) = multispace0(i)?;
    let (i, explicit_type) = opt(slice_type)(i)?;
    let (i, _) = multispace0(i)?;
    let (i, labels) = match explicit_type {
        Some(_) => {
            // labels are optional and brace-wrapped for typed slices
            let (i, braced) = opt(delimited(
                char('{'),
                label_list,
                preceded(multispace0, char('}')),
            ))(i)?;
            (i, braced.unwrap_or_default())
        }
        None => label_list(i)?,
    };
    let (i, _) = multispace0(i)?;
    Ok((
        i,
        ParsedLine {
            goal_id,
            name: name.to_string(),
            slice_type: explicit_type.unwrap_or(SliceType::Standard),
            labels: labels.into_iter().map(str::to_string).collect(),
        },
    ))
}

fn build_goal(line: ParsedLine) -> Result<Goal, Error> {
    if !Goal::is_name_valid(&line.name) {
        bail!("invalid name of goal '{}'", line.name);
    }
    for label in &line.labels {
        if !is_label_valid(label) {
            bail!("invalid label '{}'", label);
        }
    }
    let mut slice = Slice::new(line.slice_type);
    if line.slice_type.is_standard() {
        if line.labels.is_empty() {
            bail!("no labels");
        }
        for label in &line.labels {
            *slice.part_mut(0).entry(MediaLabel::new(label)?).or_insert(0) += 1;
        }
    } else {
        if line.labels.len() > line.slice_type.expected_parts() {
            bail!("too many labels for type '{}'", line.slice_type);
        }
        for part in 0..line.slice_type.expected_parts() {
            let label = match line.labels.get(part) {
                Some(label) => MediaLabel::new(label)?,
                None => MediaLabel::WILDCARD,
            };
            slice.part_mut(part).insert(label, 1);
        }
    }
    let mut goal = Goal::new(line.name);
    goal.set_slice(slice)?;
    Ok(goal)
}

/// Parse one configuration line; `Ok(None)` for blank and comment lines.
pub fn parse_line(line: &str) -> Result<Option<(GoalId, Goal)>, Error> {
    let effective = line.split('#').next().unwrap_or("");
    if effective.trim().is_empty() {
        return Ok(None);
    }
    let (rest, parsed) =
        goal_line(effective).map_err(|err| format_err!("unable to parse goal: {}", err))?;
    if !rest.trim().is_empty() {
        bail!("unexpected trailing input '{}'", rest.trim());
    }
    if !GoalId::is_valid(parsed.goal_id as i64) {
        bail!("goal ID {} out of range", parsed.goal_id);
    }
    let goal_id = GoalId(parsed.goal_id as u8);
    Ok(Some((goal_id, build_goal(parsed)?)))
}

/// The default goal of an unconfigured id: `id` plain copies, capped.
pub fn default_goal(goal_id: GoalId) -> Goal {
    let copies = (goal_id.0 as u32).min(MAX_DEFAULT_COPIES);
    let mut slice = Slice::new(SliceType::Standard);
    slice.part_mut(0).insert(MediaLabel::WILDCARD, copies);
    let mut goal = Goal::new(goal_id.0.to_string());
    goal.set_slice(slice).expect("a fresh goal accepts one slice");
    goal
}

/// Load a whole goal configuration. Every valid goal id ends up in the
/// map; ids the text does not mention get their default goal.
pub fn load(text: &str) -> Result<BTreeMap<GoalId, Goal>, Error> {
    let mut goals = BTreeMap::new();
    for (line_number, line) in text.lines().enumerate() {
        let parsed = parse_line(line)
            .map_err(|err| format_err!("line {}: {}", line_number + 1, err))?;
        if let Some((goal_id, goal)) = parsed {
            if goals.insert(goal_id, goal).is_some() {
                bail!("line {}: repeated goal ID {}", line_number + 1, goal_id);
            }
        }
    }
    for id in GoalId::MIN..=GoalId::MAX {
        goals
            .entry(GoalId(id))
            .or_insert_with(|| default_goal(GoalId(id)));
    }
    Ok(goals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sfs_types::goal::labels_count;

    fn label(name: &str) -> MediaLabel {
        MediaLabel::new(name).unwrap()
    }

    #[test]
    fn plain_copy_goals() {
        let (id, goal) = parse_line("1 some_name: _ _ ssd").unwrap().unwrap();
        assert_eq!(id, GoalId(1));
        assert_eq!(goal.name(), "some_name");
        let slice = goal.slice(SliceType::Standard).unwrap();
        assert_eq!(labels_count(slice.part(0)), 3);
        assert_eq!(slice.part(0)[&MediaLabel::WILDCARD], 2);
        assert_eq!(slice.part(0)[&label("ssd")], 1);
    }

    #[test]
    fn numeric_names_and_spacing() {
        let (id, goal) = parse_line("  10 10 : _ _ _").unwrap().unwrap();
        assert_eq!(id, GoalId(10));
        assert_eq!(goal.name(), "10");

        let (_, goal) = parse_line("12 standard    : $std {_ _ _}").unwrap().unwrap();
        assert_eq!(goal.expected_copies(), 3);
    }

    #[test]
    fn xor_goals() {
        let (_, goal) = parse_line("13 xor2 : $xor2 { A A A }").unwrap().unwrap();
        let slice = goal.slice(SliceType::Xor(2)).unwrap();
        assert_eq!(slice.expected_parts(), 3);
        for part in slice.parts() {
            assert_eq!(part[&label("A")], 1);
        }

        // no braces: all wildcard
        let (_, goal) = parse_line("15 xor2any : $xor2").unwrap().unwrap();
        let slice = goal.slice(SliceType::Xor(2)).unwrap();
        for part in slice.parts() {
            assert_eq!(part[&MediaLabel::WILDCARD], 1);
        }

        // partial labels: the rest defaults to wildcard
        let (_, goal) = parse_line("14 xor3 : $xor3{A B}").unwrap().unwrap();
        let slice = goal.slice(SliceType::Xor(3)).unwrap();
        assert_eq!(slice.part(0)[&label("A")], 1);
        assert_eq!(slice.part(1)[&label("B")], 1);
        assert_eq!(slice.part(2)[&MediaLabel::WILDCARD], 1);
        assert_eq!(slice.part(3)[&MediaLabel::WILDCARD], 1);
    }

    #[test]
    fn erasure_code_goals() {
        let (_, goal) = parse_line("20 archive : $ec(4,2) {A B}").unwrap().unwrap();
        let slice = goal.slice(SliceType::Ec(4, 2)).unwrap();
        assert_eq!(slice.expected_parts(), 6);
        assert_eq!(slice.part(0)[&label("A")], 1);
        assert_eq!(slice.part(1)[&label("B")], 1);
        assert_eq!(slice.part(5)[&MediaLabel::WILDCARD], 1);

        assert!(parse_line("20 bad : $ec(1,2)").is_err());
        assert!(parse_line("20 bad : $ec(33,2)").is_err());
        assert!(parse_line("20 bad : $ec(4,0)").is_err());
    }

    #[test]
    fn comments_and_blank_lines() {
        assert!(parse_line("").unwrap().is_none());
        assert!(parse_line("   # full line comment").unwrap().is_none());
        let (_, goal) = parse_line("3 three: _ _ _ # trailing comment").unwrap().unwrap();
        assert_eq!(goal.expected_copies(), 3);
    }

    #[test]
    fn errors() {
        // goal id out of range
        assert!(parse_line("0 zero: _").is_err());
        assert!(parse_line("41 too_big: _").is_err());
        // missing colon
        assert!(parse_line("1 name _ _").is_err());
        // xor1 does not exist
        assert!(parse_line("1 bad : $xor1").is_err());
        // too many labels for the slice
        assert!(parse_line("1 bad : $xor2 {A B C D}").is_err());
        // no labels for a plain goal
        assert!(parse_line("1 bad :").is_err());
        // garbage characters
        assert!(parse_line("1 bad : la-bel").is_err());
    }

    #[test]
    fn load_fills_defaults() {
        let config = "1 one: _\n3 three: $xor3\n# comment\n";
        let goals = load(config).unwrap();
        assert_eq!(goals.len(), GoalId::MAX as usize);
        assert_eq!(goals[&GoalId(1)].name(), "one");
        assert!(goals[&GoalId(3)].has_slice(SliceType::Xor(3)));
        // unmentioned ids get default plain-copy goals
        assert_eq!(goals[&GoalId(2)].expected_copies(), 2);
        assert_eq!(goals[&GoalId(40)].expected_copies(), MAX_DEFAULT_COPIES);
    }

    #[test]
    fn load_rejects_duplicates() {
        assert!(load("1 one: _\n1 uno: _ _\n").is_err());
    }
}
