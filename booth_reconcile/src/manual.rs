/*!

This is the long-form manual for `booth_reconcile` and `form20`.

## What it does

A Form 20 document lists, for every polling booth of an administrative unit, the
votes of every candidate. The documents are scanned, and the text layer that comes
out of OCR is noisy: headers mixed with data, columns dropped or added, digits
misread. This crate turns such raw rows into a canonical record whose numbers agree
exactly with the authoritative totals published for the unit:

1. every row is classified as a booth row or rejected with an explicit reason
2. the raw columns are matched to the official candidates by magnitude
3. the extraction is scored against the official totals and accepted or rejected
   under an acceptance policy
4. postal votes are derived as `official - booth`, booth votes being capped at the
   official total when they were over-read

A record is only produced for an accepted extraction. Nothing is ever written for
a rejected unit.

## Input formats

The following formats are supported by `form20`:
* `json` rows as `{"rows": [["1", "402", ...], ...]}` or as a bare array of rows.
  Cells may be strings or numbers.
* `csv` one row per line, no header line, rows of any length
* `xlsx` the first worksheet of an Excel workbook, or the worksheet named with
  `--excel-worksheet-name`

### Candidates

The authoritative candidates of a unit are a JSON array, in the canonical order
of the unit:

```json
[
  {"name": "Anna", "party": "P1", "officialVotes": 12400},
  {"name": "Bob", "party": "P2", "officialVotes": 9300}
]
```

The official votes include the postal votes.

## Booth rows

A booth row reads from left to right:
- a few leading numbers, one of them being the booth number (`12`, `12A`, `12 (W)`)
- the name of the polling station, which is dropped
- one vote count per candidate column; an empty cell or a dash (`-`) counts as 0, any other
  text rejects the row
- a summary block, whose shape is given by a summary layout

The layouts tried by default are, in order:

| name            | summary cells                                   |
|-----------------|-------------------------------------------------|
| `standard`      | valid total, rejected, NOTA, grand total        |
| `with_tendered` | valid total, rejected, NOTA, tendered, grand total |
| `total_only`    | valid total, rejected                           |
| `none`          | nothing                                         |

The first layout that leads to an accepted extraction wins.

## Acceptance policies

| policy     | min booth coverage | max mean error | top N | low confidence docs |
|------------|--------------------|----------------|-------|---------------------|
| `strict`   | 95%                | 2%             | 3     | rejected            |
| `lenient`  | 95%                | 30%            | 3     | accepted            |
| `degraded` | 50%                | 50%            | 2     | accepted            |

The mean error is the mean relative error of the top N candidates, after scaling
the extracted totals to the official totals.

## Batch configuration

A batch is described by a JSON file. Paths are relative to the configuration file.

```json
{
  "outputSettings": {"outputDirectory": "out"},
  "units": [
    {
      "unitId": "AC-7",
      "provider": "json",
      "filePath": "ac7_rows.json",
      "candidatesPath": "ac7_candidates.json",
      "expectedBooths": 20,
      "policy": "strict"
    }
  ],
  "rules": {"materialityFloor": 5000, "voteSumBand": [20, 3000]},
  "apportionments": [
    {
      "parentUnitId": "PC-1",
      "candidatesPath": "pc1_candidates.json",
      "segments": [{"unitId": "AC-7"}, {"unitId": "AC-8", "knownTotals": [4100, 3900]}]
    }
  ]
}
```

For every unit, `form20` writes `<unitId>.json` in the output directory, and a
`diagnostics.json` file listing the decision taken for every unit.

An apportionment splits the postal votes of a parent unit (a parliamentary
constituency) over its segments (the assembly segments), using the booth votes of
the segments. It is computed after all the segments have been processed, and
written as `<parentUnitId>.apportionment.json`.

*/
